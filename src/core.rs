//! Block versioning: the type lattice, compile-time contexts, the block and
//! branch graph, lazy branch stubs, and invalidation of compiled code.

use crate::asm::x86_64::*;
use crate::asm::*;
use crate::codegen::*;
use crate::cruby::*;
use crate::invariants::block_assumptions_free;
use crate::options::*;
use crate::stats::*;
use crate::utils::*;
use crate::virtualmem::CodePtr;
use core::ffi::c_void;
use std::cell::*;
use std::hash::{Hash, Hasher};
use std::mem;
use std::ptr;
use std::rc::Rc;
use Slot::*;
use SlotMapping::*;

/// How many of the topmost stack slots get their types tracked
pub const MAX_TEMPS: usize = 8;

/// How many locals get their types tracked
pub const MAX_LOCALS: usize = 8;

/// What is known about one run-time value slot. A small lattice: Unknown
/// at the top, the immediate/heap split under it, and the concrete kinds
/// at the bottom.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Type {
    Unknown,
    UnknownImm,
    UnknownHeap,
    Nil,
    True,
    False,
    Fixnum,
    Flonum,
    Array,
    Hash,
    ImmSymbol,
    HeapSymbol,
    String,
}

impl Default for Type {
    fn default() -> Self {
        Type::Unknown
    }
}

impl Type {
    /// Classify a concrete value observed at compile time
    pub fn from(val: VALUE) -> Type {
        if val.special_const_p() {
            if val.fixnum_p() {
                Type::Fixnum
            } else if val.flonum_p() {
                Type::Flonum
            } else if val.static_sym_p() {
                Type::ImmSymbol
            } else if val.nil_p() {
                Type::Nil
            } else if val == Qtrue {
                Type::True
            } else if val == Qfalse {
                Type::False
            } else {
                unreachable!("unknown tagged value")
            }
        } else {
            match val.builtin_type() {
                RUBY_T_ARRAY => Type::Array,
                RUBY_T_HASH => Type::Hash,
                RUBY_T_STRING => Type::String,
                RUBY_T_SYMBOL => Type::HeapSymbol,
                _ => Type::UnknownHeap,
            }
        }
    }

    /// True for the types the interpreter encodes without a heap object
    pub fn is_imm(&self) -> bool {
        matches!(
            self,
            Type::UnknownImm
                | Type::Nil
                | Type::True
                | Type::False
                | Type::Fixnum
                | Type::Flonum
                | Type::ImmSymbol
        )
    }

    /// True for types that are known to live on the heap
    pub fn is_heap(&self) -> bool {
        matches!(
            self,
            Type::UnknownHeap | Type::Array | Type::Hash | Type::HeapSymbol | Type::String
        )
    }

    /// True when nothing concrete is known
    pub fn is_unknown(&self) -> bool {
        matches!(self, Type::Unknown | Type::UnknownImm | Type::UnknownHeap)
    }

    /// Opposite of [Self::is_unknown]
    pub fn is_specific(&self) -> bool {
        !self.is_unknown()
    }

    /// Widen two types to their least common ancestor in the lattice
    pub fn join(self, other: Self) -> Self {
        if self == other {
            self
        } else if self.is_imm() && other.is_imm() {
            Type::UnknownImm
        } else if self.is_heap() && other.is_heap() {
            Type::UnknownHeap
        } else {
            Type::Unknown
        }
    }

    /// Cost of letting a value of this type flow into a slot typed `dst`.
    /// `Some(0)` is an exact match, higher is lossier, and `None` means the
    /// types are incompatible and a guard would be required.
    pub fn diff(self, dst: Self) -> Option<u8> {
        if self == dst {
            return Some(0);
        }

        // Every type can flow into the top of the lattice
        if dst == Type::Unknown {
            return Some(1);
        }

        // A concrete type can flow into its side of the imm/heap split
        if self.is_heap() && dst == Type::UnknownHeap {
            return Some(1);
        }
        if self.is_imm() && dst == Type::UnknownImm {
            return Some(1);
        }

        None
    }

    /// Narrow to a more specific compatible type, after a guard proved it
    fn upgrade(&mut self, new_type: Self) {
        assert!(new_type.diff(*self).is_some(), "refinement must be compatible");
        *self = new_type;
    }
}

/// Where a tracked stack slot's value came from. A slot aliasing a local
/// or self observes type refinements of its source.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SlotMapping {
    /// Plain stack value; its type is tracked in the slot itself
    ToStack,
    /// Same value as self
    ToSelf,
    /// Same value as the local with this index
    ToLocal(u8),
}

impl Default for SlotMapping {
    fn default() -> Self {
        ToStack
    }
}

/// A value slot an instruction operates on: either self or one of the
/// topmost stack entries (0 = top of stack)
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Slot {
    SelfSlot,
    Stack(u16),
}

/// The abstract interpreter state at one point in a block version. Two
/// contexts are equivalent iff every field compares equal; equivalence is
/// the deduplication key for block versions.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct Context {
    /// Number of values on the temporary stack
    stack_size: u16,

    /// Delta between the interpreter-visible SP and ours. Stack operations
    /// run ahead of cfp->sp; this is how far ahead we are.
    sp_offset: i16,

    /// Position of this version in a polymorphic guard chain
    chain_depth: u8,

    /// What we know about self
    self_type: Type,

    /// Types of the first MAX_LOCALS locals
    locals: [Type; MAX_LOCALS],

    /// Types of the topmost stack slots that map to the stack itself
    temps: [Type; MAX_TEMPS],

    /// Where each tracked stack slot's value came from
    mappings: [SlotMapping; MAX_TEMPS],
}

/// A (bytecode, index) pair naming a position compiled code can start at
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockId {
    pub iseq: IseqPtr,
    pub idx: u32,
}

/// Sentinel for branch targets that haven't been filled in
pub const BLOCKID_NULL: BlockId = BlockId {
    iseq: ptr::null(),
    idx: 0,
};

/// Layout of a branch relative to its targets
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BranchShape {
    Next0,   // Target 0 directly follows the branch
    Next1,   // Target 1 directly follows the branch
    Default, // Neither target follows; both need explicit jumps
}

/// The kinds of jumps a branch knows how to (re)generate. Keeping this as
/// data rather than code lets a branch be re-emitted with new target
/// addresses or a new shape after linking and invalidation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BranchGenFn {
    /// Unconditional transfer to target 0
    Jump,
    /// Go to target 0 when the zero flag is set, else target 1
    JumpIfZero,
    /// Go to target 0 when the zero flag is clear, else target 1
    JumpIfNotZero,
    /// One-sided guard: jump to target 0 on the given condition, fall
    /// through otherwise. Only valid with the Default shape.
    Guard(Cc),
    /// No control transfer: store target 0 into cfp->jit_return so the
    /// callee's `leave` lands there
    SetJitReturn,
}

impl BranchGenFn {
    pub fn emit(
        &self,
        cb: &mut CodeBlock,
        target0: CodePtr,
        target1: Option<CodePtr>,
        shape: BranchShape,
    ) {
        match self {
            BranchGenFn::Jump => match shape {
                BranchShape::Next0 => {}
                BranchShape::Next1 => unreachable!("jump can't fall through to target 1"),
                BranchShape::Default => cb.jmp_ptr(target0),
            },
            BranchGenFn::JumpIfZero => match shape {
                BranchShape::Next0 => cb.jcc_ptr(Cc::NE, target1.unwrap()),
                BranchShape::Next1 => cb.jcc_ptr(Cc::E, target0),
                BranchShape::Default => {
                    cb.jcc_ptr(Cc::E, target0);
                    cb.jmp_ptr(target1.unwrap());
                }
            },
            BranchGenFn::JumpIfNotZero => match shape {
                BranchShape::Next0 => cb.jcc_ptr(Cc::E, target1.unwrap()),
                BranchShape::Next1 => cb.jcc_ptr(Cc::NE, target0),
                BranchShape::Default => {
                    cb.jcc_ptr(Cc::NE, target0);
                    cb.jmp_ptr(target1.unwrap());
                }
            },
            BranchGenFn::Guard(cc) => {
                assert_eq!(shape, BranchShape::Default);
                cb.jcc_ptr(*cc, target0);
            }
            BranchGenFn::SetJitReturn => {
                assert_eq!(shape, BranchShape::Default);
                cb.mov(REG0, Opnd::code_ptr(target0));
                cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_JIT_RETURN), REG0);
            }
        }
    }
}

/// One destination of a branch: which bytecode position with which entry
/// context, plus the link state (a compiled block or a stub address)
#[derive(Debug)]
struct BranchTarget {
    id: BlockId,
    ctx: Context,
    /// The compiled block this target is linked to, if any
    block: Option<BlockRef>,
    /// Where the branch currently jumps for this target: the block entry
    /// when linked, a stub when not. None before the stub is made, or to
    /// request fallthrough compilation.
    addr: Option<CodePtr>,
}

impl BranchTarget {
    fn unset() -> Self {
        BranchTarget {
            id: BLOCKID_NULL,
            ctx: Context::default(),
            block: None,
            addr: None,
        }
    }
}

/// An outgoing control-flow edge of a block. Owns up to two targets and
/// knows how to re-emit its own jump instructions.
pub struct Branch {
    /// The block this edge leaves from
    block: BlockRef,

    /// Code range of the emitted jump instructions
    start_addr: Option<CodePtr>,
    end_addr: Option<CodePtr>,

    /// What kind of jump to emit
    gen_fn: BranchGenFn,

    /// Current layout relative to the targets
    shape: BranchShape,

    targets: [BranchTarget; 2],
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Branch")
            .field("start", &self.start_addr)
            .field("end", &self.end_addr)
            .field("gen_fn", &self.gen_fn)
            .finish()
    }
}

impl Branch {
    fn code_size(&self) -> usize {
        self.end_addr.unwrap().into_usize() - self.start_addr.unwrap().into_usize()
    }

    /// True while gen_direct_jump() has left this branch as a request for
    /// the next block to be compiled immediately after it
    fn wants_fallthrough(&self) -> bool {
        self.targets[0].addr.is_none()
            && self.targets[1].addr.is_none()
            && !self.targets[0].id.iseq.is_null()
    }
}

/// A method lookup result a block was specialized against. Both halves are
/// needed to scrub the assumption registry when the block dies.
#[derive(Debug)]
pub struct CmeDependency {
    pub receiver_klass: VALUE,
    pub callee_cme: *const rb_callable_method_entry_t,
}

/// One compiled specialization of a bytecode range, keyed by the context
/// it was entered with
#[derive(Debug)]
pub struct Block {
    /// First instruction this version covers
    blockid: BlockId,

    /// Index one past the last covered instruction
    end_idx: u32,

    /// Entry context. Never mutated after compilation.
    ctx: Context,

    /// Code range in the inline arena
    start_addr: Option<CodePtr>,
    end_addr: Option<CodePtr>,

    /// Edges pointing at this block, shared with the owning branches
    incoming: Vec<BranchRef>,

    /// Edges leaving this block
    outgoing: Vec<BranchRef>,

    /// Offsets of GC references embedded in this block's machine code.
    /// The collector traces and updates them through these offsets; the
    /// code buffer itself is invisible to the GC.
    gc_object_offsets: Vec<u32>,

    /// Method lookups this block was specialized against
    cme_dependencies: Vec<CmeDependency>,

    /// Exit to the interpreter at this block's entry. Invalidation patches
    /// jumps to here.
    pub entry_exit: Option<CodePtr>,
}

/// Shared handle to a [Block], hashable by identity so blocks can live in
/// registry sets
#[derive(Debug)]
pub struct BlockRef(Rc<RefCell<Block>>);

/// Shared handle to a [Branch]
type BranchRef = Rc<RefCell<Branch>>;

/// All versions compiled for one (iseq, index) position
type VersionList = Vec<BlockRef>;

/// Per-iseq table of version lists, indexed by instruction index
type VersionMap = Vec<VersionList>;

impl BlockRef {
    pub fn new(rc: Rc<RefCell<Block>>) -> Self {
        Self(rc)
    }

    pub fn borrow(&self) -> Ref<'_, Block> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Block> {
        self.0.borrow_mut()
    }
}

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Hash for BlockRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0).hash(state);
    }
}

impl PartialEq for BlockRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for BlockRef {}

/// Everything the JIT hangs off an iseq. The host allocates iseqs; we
/// allocate this lazily and the host hands it back to us in callbacks.
#[derive(Default)]
pub struct IseqPayload {
    pub version_map: VersionMap,
}

impl IseqPayload {
    /// Empty the version table, yielding every block it held
    pub fn take_all_blocks(&mut self) -> impl Iterator<Item = BlockRef> {
        mem::take(&mut self.version_map).into_iter().flatten()
    }
}

/// Fetch an iseq's payload, creating it on first use.
pub fn get_iseq_payload(iseq: IseqPtr) -> &'static mut IseqPayload {
    let payload = unsafe { rb_iseq_get_bbjit_payload(iseq) } as *mut IseqPayload;

    let payload = if payload.is_null() {
        // The GC owns the payload from here on; it calls rb_bbjit_iseq_free
        // when the iseq dies and the Box is reclaimed there.
        let fresh = Box::into_raw(Box::new(IseqPayload::default()));
        unsafe { rb_iseq_set_bbjit_payload(iseq, fresh as *mut c_void) };
        fresh
    } else {
        payload
    };

    // SAFETY: mutations only happen under the VM lock, and the payload
    // outlives this borrow because only the GC frees it.
    unsafe { payload.as_mut() }.unwrap()
}

/// Run a callback over every live iseq
pub fn for_each_iseq<F: FnMut(IseqPtr)>(mut callback: F) {
    unsafe extern "C" fn trampoline(iseq: IseqPtr, data: *mut c_void) {
        // SAFETY: data points at the `&mut dyn FnMut` local below
        let callback: &mut &mut dyn FnMut(IseqPtr) = unsafe { std::mem::transmute(&mut *data) };
        callback(iseq);
    }
    let mut erased: &mut dyn FnMut(IseqPtr) = &mut callback;
    unsafe { rb_bbjit_for_each_iseq(Some(trampoline), (&mut erased) as *mut _ as *mut c_void) };
}

/// GC hook: the iseq owning this payload is dead, tear everything down
#[no_mangle]
pub extern "C" fn rb_bbjit_iseq_free(payload: *mut c_void) {
    if payload.is_null() {
        return;
    }

    // SAFETY: created by Box::into_raw in get_iseq_payload
    let payload = unsafe { Box::from_raw(payload as *mut IseqPayload) };

    for versions in &payload.version_map {
        for block in versions {
            free_block(block);
        }
    }
}

/// GC hook: mark every heap reference reachable from this payload
#[no_mangle]
pub extern "C" fn rb_bbjit_iseq_mark(payload: *mut c_void) {
    if payload.is_null() {
        return;
    }
    // SAFETY: the GC holds the VM lock while marking
    let payload = unsafe { &*(payload as *const IseqPayload) };

    let cb = CodegenGlobals::get_inline_cb();

    for block in payload.version_map.iter().flatten() {
        let block = block.borrow();

        unsafe { rb_gc_mark_movable(block.blockid.iseq.into()) };

        for dep in &block.cme_dependencies {
            unsafe { rb_gc_mark_movable(dep.receiver_klass) };
            unsafe { rb_gc_mark_movable(dep.callee_cme.into()) };
        }

        // Branch targets name iseqs that must stay alive while stubs
        // point at them
        for branchref in &block.outgoing {
            let branch = branchref.borrow();
            for target in &branch.targets {
                if !target.id.iseq.is_null() {
                    unsafe { rb_gc_mark_movable(target.id.iseq.into()) };
                }
            }
        }

        // Constants baked into the machine code
        for &offset in &block.gc_object_offsets {
            let value_ptr = cb.get_ptr(offset.as_usize()).raw_ptr() as *const VALUE;
            // SAFETY: the offset was recorded when the value was written
            let object = unsafe { value_ptr.read_unaligned() };
            unsafe { rb_gc_mark_movable(object) };
        }
    }
}

/// GC hook: compaction moved objects; chase every reference we hold.
/// Mirrors [rb_bbjit_iseq_mark].
#[no_mangle]
pub extern "C" fn rb_bbjit_iseq_update_references(payload: *mut c_void) {
    if payload.is_null() {
        return;
    }
    // SAFETY: the GC holds the VM lock while updating references
    let payload = unsafe { &*(payload as *const IseqPayload) };

    let cb = CodegenGlobals::get_inline_cb();

    for block in payload.version_map.iter().flatten() {
        let mut block = block.borrow_mut();

        block.blockid.iseq = unsafe { rb_gc_location(block.blockid.iseq.into()) }.as_iseq();

        for dep in &mut block.cme_dependencies {
            dep.receiver_klass = unsafe { rb_gc_location(dep.receiver_klass) };
            dep.callee_cme = unsafe { rb_gc_location(dep.callee_cme.into()) }.as_cme();
        }

        for branchref in &block.outgoing {
            let mut branch = branchref.borrow_mut();
            for target in &mut branch.targets {
                if !target.id.iseq.is_null() {
                    target.id.iseq = unsafe { rb_gc_location(target.id.iseq.into()) }.as_iseq();
                }
            }
        }

        // Patch moved constants into the machine code, byte by byte
        for &offset in &block.gc_object_offsets {
            let value_code_ptr = cb.get_ptr(offset.as_usize());
            let value_ptr = value_code_ptr.raw_ptr() as *const VALUE;
            // SAFETY: the offset was recorded when the value was written
            let object = unsafe { value_ptr.read_unaligned() };
            let moved = unsafe { rb_gc_location(object) };

            // Skip untouched values to stay copy-on-write friendly
            if moved != object {
                for (i, &byte) in moved.as_u64().to_le_bytes().iter().enumerate() {
                    cb.write_mem(value_code_ptr.add_bytes(i), byte)
                        .expect("patched range should be in bounds");
                }
            }
        }
    }

    cb.mark_all_executable();
    CodegenGlobals::get_outlined_cb().unwrap().mark_all_executable();
}

/// Version list for a position, growing the table as needed
fn get_version_list(blockid: BlockId) -> &'static mut VersionList {
    let payload = get_iseq_payload(blockid.iseq);
    let insn_idx = blockid.idx.as_usize();

    if insn_idx >= payload.version_map.len() {
        payload.version_map.resize(insn_idx + 1, VersionList::default());
    }

    &mut payload.version_map[insn_idx]
}

/// Detach and return all versions at a position
pub fn take_version_list(blockid: BlockId) -> VersionList {
    let payload = get_iseq_payload(blockid.iseq);

    match payload.version_map.get_mut(blockid.idx.as_usize()) {
        Some(versions) => mem::take(versions),
        None => VersionList::default(),
    }
}

/// Find the best existing version a jump with context `ctx` may target:
/// the compatible version with the lowest transition cost. Returns None
/// when nothing compatible exists, or when greedy versioning prefers to
/// make a fresh exact version instead of an imperfect match.
fn find_block_version(blockid: BlockId, ctx: &Context) -> Option<BlockRef> {
    let versions = get_version_list(blockid);

    let mut best: Option<(usize, BlockRef)> = None;
    for blockref in versions.iter() {
        if let Some(cost) = ctx.diff(&blockref.borrow().ctx) {
            // Strict comparison keeps the oldest version on ties, which
            // guard chains rely on.
            if best.as_ref().map_or(true, |(b, _)| cost < *b) {
                best = Some((cost, blockref.clone()));
            }
        }
    }

    if get_option!(greedy_versioning) {
        if let Some((cost, _)) = &best {
            // Below the version limit, keep specializing instead of
            // settling for a lossy match
            if *cost > 0 && versions.len() + 1 < get_option!(max_versions) {
                return None;
            }
        }
    }

    best.map(|(_, blockref)| blockref)
}

/// Cap the number of versions per position. When a request would push a
/// position past the limit, substitute a generic context that all later
/// requests can share.
pub fn limit_block_versions(blockid: BlockId, ctx: &Context) -> Context {
    // Guard chains enforce their own depth caps
    if ctx.chain_depth > 0 {
        return *ctx;
    }

    let versions = get_version_list(blockid).len();
    if versions + 1 < get_option!(max_versions) {
        return *ctx;
    }

    // Same stack geometry, no type knowledge
    let mut generic = Context::default();
    generic.stack_size = ctx.stack_size;
    generic.sp_offset = ctx.sp_offset;

    debug_assert!(
        ctx.diff(&generic).is_some(),
        "the generic context must accept anything the specific one did"
    );

    generic
}

/// Register a fully constructed block version so lookups can find it
fn add_block_version(blockref: &BlockRef) {
    let block = blockref.borrow();

    // Method entry blocks start with an empty stack
    assert!(!(block.blockid.idx == 0 && block.ctx.stack_size > 0));

    get_version_list(block.blockid).push(blockref.clone());

    // The iseq now references this block's heap objects; tell the GC
    let iseq: VALUE = block.blockid.iseq.into();
    for dep in &block.cme_dependencies {
        obj_written!(iseq, dep.receiver_klass);
        obj_written!(iseq, dep.callee_cme.into());
    }
    let cb = CodegenGlobals::get_inline_cb();
    for &offset in &block.gc_object_offsets {
        let value_ptr = cb.get_ptr(offset.as_usize()).raw_ptr() as *const VALUE;
        let object = unsafe { value_ptr.read_unaligned() };
        obj_written!(iseq, object);
    }

    incr_counter(Counter::compiled_block_count);
}

/// Drop a version from its position's list so nothing new can target it
fn remove_block_version(blockref: &BlockRef) {
    let blockid = blockref.borrow().blockid;
    get_version_list(blockid).retain(|other| other != blockref);
}

impl Block {
    pub fn new(blockid: BlockId, ctx: &Context) -> BlockRef {
        BlockRef::new(Rc::new(RefCell::new(Block {
            blockid,
            end_idx: 0,
            ctx: *ctx,
            start_addr: None,
            end_addr: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            gc_object_offsets: Vec::new(),
            cme_dependencies: Vec::new(),
            entry_exit: None,
        })))
    }

    pub fn get_blockid(&self) -> BlockId {
        self.blockid
    }

    pub fn get_end_idx(&self) -> u32 {
        self.end_idx
    }

    pub fn get_ctx(&self) -> Context {
        self.ctx
    }

    pub fn get_start_addr(&self) -> Option<CodePtr> {
        self.start_addr
    }

    pub fn get_end_addr(&self) -> Option<CodePtr> {
        self.end_addr
    }

    pub fn iter_cme_deps(&self) -> std::slice::Iter<'_, CmeDependency> {
        self.cme_dependencies.iter()
    }

    /// Record where this block's code begins. Done exactly once.
    pub fn set_start_addr(&mut self, addr: CodePtr) {
        assert!(self.start_addr.is_none());
        self.start_addr = Some(addr);
    }

    /// Record where this block's code ends. Requires a start address.
    pub fn set_end_addr(&mut self, addr: CodePtr) {
        assert!(self.start_addr.is_some());
        self.end_addr = Some(addr);
    }

    /// Record the end of the covered bytecode range. Done exactly once.
    pub fn set_end_idx(&mut self, end_idx: u32) {
        assert!(self.end_idx == 0);
        self.end_idx = end_idx;
    }

    /// Note a GC reference embedded at this offset in the inline arena
    pub fn add_gc_object_offset(&mut self, ptr_offset: u32) {
        self.gc_object_offsets.push(ptr_offset);
    }

    /// Note a method lookup this block depends on staying stable
    pub fn add_cme_dependency(
        &mut self,
        receiver_klass: VALUE,
        callee_cme: *const rb_callable_method_entry_t,
    ) {
        self.cme_dependencies.push(CmeDependency {
            receiver_klass,
            callee_cme,
        });
    }
}

impl Context {
    pub fn new_with_stack_size(size: i16) -> Self {
        let mut ctx = Context::default();
        ctx.stack_size = size as u16;
        ctx.sp_offset = size;
        ctx
    }

    pub fn new() -> Self {
        Context::default()
    }

    pub fn get_stack_size(&self) -> u16 {
        self.stack_size
    }

    pub fn get_sp_offset(&self) -> i16 {
        self.sp_offset
    }

    pub fn set_sp_offset(&mut self, offset: i16) {
        self.sp_offset = offset;
    }

    pub fn get_chain_depth(&self) -> u8 {
        self.chain_depth
    }

    pub fn reset_chain_depth(&mut self) {
        self.chain_depth = 0;
    }

    pub fn increment_chain_depth(&mut self) {
        self.chain_depth = self
            .chain_depth
            .checked_add(1)
            .expect("guard chain too deep");
    }

    /// Address of a byte offset from the not-yet-materialized SP
    pub fn sp_opnd(&self, offset_bytes: isize) -> Opnd {
        let disp = (self.sp_offset as isize) * (SIZEOF_VALUE as isize) + offset_bytes;
        Opnd::mem(64, REG_SP, disp as i32)
    }

    /// Address of the nth topmost stack slot (0 = top)
    pub fn stack_opnd(&self, idx: i32) -> Opnd {
        let disp = ((self.sp_offset as i32) - 1 - idx) * SIZEOF_VALUE_I32;
        Opnd::mem(64, REG_SP, disp)
    }

    /// Index into the tracking arrays for the nth topmost slot, when it's
    /// within tracked range
    fn tracked_idx(&self, nth_from_top: u16) -> Option<usize> {
        assert!(nth_from_top < self.stack_size);
        let idx = (self.stack_size - 1 - nth_from_top).as_usize();
        (idx < MAX_TEMPS).then(|| idx)
    }

    /// Grow the stack by one slot with the given origin and type.
    /// Returns the address of the new top.
    pub fn stack_push_mapping(&mut self, mapping: SlotMapping, ty: Type) -> Opnd {
        // With type propagation off, record origins but never types
        let ty = if get_option!(no_type_prop) { Type::Unknown } else { ty };

        let slot = self.stack_size.as_usize();
        if slot < MAX_TEMPS {
            if let ToLocal(local_idx) = mapping {
                assert!((local_idx as usize) < MAX_LOCALS);
            }
            self.mappings[slot] = mapping;
            self.temps[slot] = ty;
        }

        self.stack_size += 1;
        self.sp_offset += 1;

        self.stack_opnd(0)
    }

    /// Push a plain stack value of a known type
    pub fn stack_push(&mut self, ty: Type) -> Opnd {
        self.stack_push_mapping(ToStack, ty)
    }

    /// Push a copy of self
    pub fn stack_push_self(&mut self) -> Opnd {
        self.stack_push_mapping(ToSelf, Type::Unknown)
    }

    /// Push a copy of a local variable
    pub fn stack_push_local(&mut self, local_idx: usize) -> Opnd {
        if local_idx >= MAX_LOCALS {
            return self.stack_push(Type::Unknown);
        }
        self.stack_push_mapping(ToLocal(local_idx as u8), Type::Unknown)
    }

    /// Shrink the stack by n slots, forgetting what was known about them.
    /// Returns the address of the old top.
    pub fn stack_pop(&mut self, n: usize) -> Opnd {
        assert!(n <= self.stack_size.into());

        let top = self.stack_opnd(0);

        for popped in 0..n {
            if let Some(idx) = self.tracked_idx(popped as u16) {
                self.mappings[idx] = ToStack;
                self.temps[idx] = Type::Unknown;
            }
        }

        self.stack_size -= n as u16;
        self.sp_offset -= n as i16;

        top
    }

    /// What is known about the value in a slot
    pub fn get_opnd_type(&self, slot: Slot) -> Type {
        match slot {
            SelfSlot => self.self_type,
            Stack(n) => match self.tracked_idx(n) {
                None => Type::Unknown,
                Some(idx) => match self.mappings[idx] {
                    ToStack => self.temps[idx],
                    ToSelf => self.self_type,
                    ToLocal(local_idx) => self.locals[local_idx as usize],
                },
            },
        }
    }

    /// Where a slot's value came from, together with its type. Pass the
    /// result to [Self::stack_push_mapping] or [Self::set_opnd_mapping] to
    /// copy a slot without losing the alias.
    pub fn get_opnd_mapping(&self, slot: Slot) -> (SlotMapping, Type) {
        let ty = self.get_opnd_type(slot);
        match slot {
            SelfSlot => (ToSelf, ty),
            Stack(n) => match self.tracked_idx(n) {
                Some(idx) => (self.mappings[idx], ty),
                None => {
                    // Beyond tracked range everything is a plain stack value
                    assert!(ty == Type::Unknown);
                    (ToStack, ty)
                }
            },
        }
    }

    /// Overwrite a stack slot's origin and type
    pub fn set_opnd_mapping(&mut self, slot: Slot, (mapping, ty): (SlotMapping, Type)) {
        match slot {
            SelfSlot => unreachable!("self's mapping is fixed"),
            Stack(n) => {
                if get_option!(no_type_prop) {
                    return;
                }
                if let Some(idx) = self.tracked_idx(n) {
                    self.mappings[idx] = mapping;
                    // The type matters only for plain stack values
                    self.temps[idx] = ty;
                }
            }
        }
    }

    /// Narrow what is known about a slot after a guard passed. The
    /// refinement follows the slot's mapping back to its source, so an
    /// aliased local or self learns the type too.
    pub fn upgrade_opnd_type(&mut self, slot: Slot, ty: Type) {
        if get_option!(no_type_prop) {
            return;
        }

        match slot {
            SelfSlot => self.self_type.upgrade(ty),
            Stack(n) => {
                if let Some(idx) = self.tracked_idx(n) {
                    match self.mappings[idx] {
                        ToStack => self.temps[idx].upgrade(ty),
                        ToSelf => self.self_type.upgrade(ty),
                        ToLocal(local_idx) => self.locals[local_idx as usize].upgrade(ty),
                    }
                }
            }
        }
    }

    /// The tracked type of a local variable
    pub fn get_local_type(&self, local_idx: usize) -> Type {
        self.locals.get(local_idx).copied().unwrap_or(Type::Unknown)
    }

    /// Record a write to a local. Stack slots that aliased the local keep
    /// its previous value, so they are detached and keep the old type.
    pub fn set_local_type(&mut self, local_idx: usize, local_type: Type) {
        if get_option!(no_type_prop) || local_idx >= MAX_LOCALS {
            return;
        }

        for slot in 0..MAX_TEMPS {
            if self.mappings[slot] == ToLocal(local_idx as u8) {
                self.temps[slot] = self.locals[local_idx];
                self.mappings[slot] = ToStack;
            }
        }

        self.locals[local_idx] = local_type;
    }

    /// Forget every local type, eg: because code we can't see ran and may
    /// have rebound the frame's locals. Aliased stack slots are detached
    /// first: the stack values themselves didn't change.
    pub fn clear_local_types(&mut self) {
        for slot in 0..MAX_TEMPS {
            if let ToLocal(local_idx) = self.mappings[slot] {
                self.temps[slot] = self.locals[local_idx as usize];
                self.mappings[slot] = ToStack;
            }
        }
        self.locals = [Type::Unknown; MAX_LOCALS];
    }

    /// Cost of entering code compiled for `dst` while in state `self`.
    /// None means incompatible: taking that edge would be unsound.
    pub fn diff(&self, dst: &Context) -> Option<usize> {
        // Versions inside a guard chain are keyed by depth and can only be
        // reached through their chain
        if self.chain_depth != 0 || dst.chain_depth != 0 {
            return None;
        }

        // Stack geometry is structural; no partial credit
        if self.stack_size != dst.stack_size || self.sp_offset != dst.sp_offset {
            return None;
        }

        let mut cost = self.self_type.diff(dst.self_type)? as usize;

        for (ours, theirs) in self.locals.iter().zip(dst.locals.iter()) {
            cost += ours.diff(*theirs)? as usize;
        }

        for n in 0..self.stack_size {
            let (our_map, our_ty) = self.get_opnd_mapping(Stack(n));
            let (their_map, their_ty) = dst.get_opnd_mapping(Stack(n));

            if our_map != their_map {
                if their_map == ToStack {
                    // Forgetting where a value came from is allowed
                    cost += 1;
                } else {
                    // Gaining an alias out of thin air is not
                    return None;
                }
            }

            cost += our_ty.diff(their_ty)? as usize;
        }

        Some(cost)
    }
}

//===========================================================================
// Compilation driver
//===========================================================================

/// Compile a run of block versions starting at `blockid`, following
/// fallthrough requests, and return the first block. On any failure the
/// whole run is rolled back so no half-linked code is reachable.
pub fn gen_block_series(
    blockid: BlockId,
    start_ctx: &Context,
    ec: EcPtr,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> Option<BlockRef> {
    let mut compiled: Vec<BlockRef> = Vec::with_capacity(4);

    let first_block = match gen_single_block(blockid, start_ctx, ec, cb, ocb) {
        Ok(block) => block,
        Err(()) => {
            incr_counter(Counter::compilation_failure);
            return None;
        }
    };
    add_block_version(&first_block);
    compiled.push(first_block.clone());

    // Keep going while the newest block's last branch asks for its target
    // to be placed directly after it
    loop {
        let last_branchref = match compiled.last().unwrap().borrow().outgoing.last() {
            Some(branchref) => branchref.clone(),
            None => break,
        };

        let (target_id, target_ctx) = {
            let branch = last_branchref.borrow();
            if !branch.wants_fallthrough() {
                break;
            }
            (branch.targets[0].id, branch.targets[0].ctx)
        };

        let next_block = match gen_single_block(target_id, &target_ctx, ec, cb, ocb) {
            Ok(block) => block,
            Err(()) => {
                // Unwind the whole batch
                for blockref in &compiled {
                    free_block(blockref);
                    remove_block_version(blockref);
                }
                incr_counter(Counter::compilation_failure);
                return None;
            }
        };
        add_block_version(&next_block);

        // Wire the fallthrough edge
        {
            let mut branch = last_branchref.borrow_mut();
            let mut block = next_block.borrow_mut();
            branch.targets[0].block = Some(next_block.clone());
            branch.targets[0].addr = block.start_addr;
            block.incoming.push(last_branchref.clone());

            // Fallthrough means exactly that
            assert!(block.start_addr == branch.end_addr);
        }

        compiled.push(next_block);
    }

    Some(first_block)
}

/// Compile an interpreter entry point for an iseq. Returns the address the
/// interpreter should call, or None if compilation failed.
/// Assumes the VM lock is held.
pub fn gen_entry_point(iseq: IseqPtr, ec: EcPtr) -> Option<CodePtr> {
    // The interpreter may enter mid-iseq when optional parameters skip
    // ahead; compile from wherever its PC points.
    let insn_idx: u32 = unsafe {
        let pc = get_cfp_pc(get_ec_cfp(ec));
        iseq_pc_to_insn_idx(iseq, pc)?
    };
    let blockid = BlockId { iseq, idx: insn_idx };

    let cb = CodegenGlobals::get_inline_cb();
    let ocb = CodegenGlobals::get_outlined_cb();

    // The prologue precedes the first block. It can fail on OOM.
    let code_ptr = gen_entry_prologue(cb, iseq, insn_idx);

    let first_block = gen_block_series(blockid, &Context::default(), ec, cb, ocb);

    cb.mark_all_executable();
    ocb.unwrap().mark_all_executable();

    match first_block {
        // A block with no instructions compiled means nothing to run
        Some(block) if block.borrow().end_idx != insn_idx => code_ptr,
        _ => None,
    }
}

//===========================================================================
// Branches and stubs
//===========================================================================

/// Rewrite a branch's jump instructions in place, eg: after one of its
/// targets moved or its shape changed. Branches may shrink but the caller
/// must ensure they never outgrow their original code range.
fn regenerate_branch(cb: &mut CodeBlock, branch: &mut Branch) {
    if branch.start_addr.unwrap() < cb.get_ptr(cb.get_frozen_bytes()) {
        // This branch is part of the frozen region; leave it alone.
        return;
    }

    let block = branch.block.borrow_mut();
    let branch_ends_block = branch.end_addr == block.end_addr;

    // Rewind to the branch and re-emit it
    let saved_pos = cb.get_write_pos();
    cb.set_write_ptr(branch.start_addr.unwrap());
    branch.gen_fn.emit(
        cb,
        branch.targets[0].addr.unwrap(),
        branch.targets[1].addr,
        branch.shape,
    );
    branch.end_addr = Some(cb.get_write_ptr());

    // A shrinking terminal branch also shrinks its block
    drop(block);
    if branch_ends_block {
        branch.block.borrow_mut().end_addr = branch.end_addr;
    }

    // When the branch sits at the end of the arena, leave the cursor at
    // its (possibly reduced) end; otherwise restore where we were.
    if saved_pos > cb.get_write_pos() {
        cb.set_pos(saved_pos);
    }
}

/// Allocate a new branch hanging off the given block
fn new_branch(block: &BlockRef, gen_fn: BranchGenFn) -> BranchRef {
    let branch = Rc::new(RefCell::new(Branch {
        block: block.clone(),
        start_addr: None,
        end_addr: None,
        gen_fn,
        shape: BranchShape::Default,
        targets: [BranchTarget::unset(), BranchTarget::unset()],
    }));

    block.borrow_mut().outgoing.push(branch.clone());
    branch
}

c_callable! {
    /// Entry point the branch stubs call, following the SysV convention.
    /// Stub emission lives in [gen_branch_target].
    fn branch_stub_hit(branch_ptr: *const c_void, target_idx: u32, ec: EcPtr) -> *const u8 {
        with_vm_lock(src_loc!(), || {
            branch_stub_hit_body(branch_ptr, target_idx, ec)
        })
    }
}

/// First execution reached an unlinked branch target: compile (or find)
/// the target block, link the branch to it, and hand back the address to
/// continue at.
fn branch_stub_hit_body(branch_ptr: *const c_void, target_idx: u32, ec: EcPtr) -> *const u8 {
    assert!(!branch_ptr.is_null());

    // Revive the Rc the stub holds a leaked count on. The count stays
    // leaked because the same stub can be hit again (eg: from another
    // ractor before this patch lands).
    let branchref = unsafe { BranchRef::from_raw(branch_ptr as *const RefCell<Branch>) };
    unsafe { Rc::increment_strong_count(branch_ptr as *const RefCell<Branch>) };

    let target_idx = target_idx.as_usize();
    let target_shape = if target_idx == 0 { BranchShape::Next0 } else { BranchShape::Next1 };

    // Take what we need out of the branch before compiling anything
    let (target_id, target_ctx) = {
        let branch = branchref.borrow();
        let target = &branch.targets[target_idx];

        // Racing hits can find the branch already linked; just jump there
        if target.block.is_some() {
            return target.addr.unwrap().raw_ptr();
        }
        (target.id, target.ctx)
    };

    let cb = CodegenGlobals::get_inline_cb();
    let ocb = CodegenGlobals::get_outlined_cb();

    // Reconstruct interpreter state before compiling: the GC roots the
    // value stack through cfp->sp, and compilation can allocate. The PC
    // may also be stale while running generated code.
    let (cfp, saved_interp_sp) = unsafe {
        let cfp = get_ec_cfp(ec);
        let saved_sp = get_cfp_sp(cfp);
        rb_set_cfp_pc(cfp, rb_iseq_pc_at_idx(target_id.iseq, target_id.idx));
        rb_set_cfp_sp(cfp, saved_sp.offset(target_ctx.get_sp_offset() as isize));
        (cfp, saved_sp)
    };

    let mut target_block = find_block_version(target_id, &target_ctx);

    if target_block.is_none() {
        // When the stub was hit with the arena cursor still at the end of
        // the branch, the new block can fall in right behind it. Reshape
        // before compiling so the branch can shrink.
        let reshaped = {
            let mut branch = branchref.borrow_mut();
            if branch.end_addr == Some(cb.get_write_ptr()) {
                assert!(branch.end_addr == branch.block.borrow().end_addr);
                branch.shape = target_shape;
                regenerate_branch(cb, &mut branch);
                // Drop any slack the reshape left so the block really is
                // adjacent
                cb.set_write_ptr(branch.end_addr.unwrap());
                true
            } else {
                false
            }
        };

        target_block = gen_block_series(target_id, &target_ctx, ec, cb, ocb);

        if target_block.is_none() && reshaped {
            // Compilation failed; the branch must work standalone again
            let mut branch = branchref.borrow_mut();
            branch.shape = BranchShape::Default;
            regenerate_branch(cb, &mut branch);
        }
    }

    let continue_at = match target_block {
        Some(blockref) => {
            let initial_size = branchref.borrow().code_size();

            blockref.borrow_mut().incoming.push(branchref.clone());
            let entry = blockref.borrow().start_addr.unwrap();

            {
                let mut branch = branchref.borrow_mut();
                branch.targets[target_idx].addr = Some(entry);
                branch.targets[target_idx].block = Some(blockref.clone());

                // An adjacent-shaped branch must really be adjacent
                assert!(!(branch.shape == target_shape && branch.end_addr != Some(entry)));

                regenerate_branch(cb, &mut branch);
                assert!(
                    branch.code_size() <= initial_size,
                    "patched branches must not grow"
                );
            }

            // The code we jump to expects the SP we came in with
            unsafe { rb_set_cfp_sp(cfp, saved_interp_sp) };

            entry
        }
        None => {
            // Out of memory or unsupported code. The PC and SP set above
            // are exactly the interpreter state to resume at, so exit.
            // Deliberately not restoring the original SP.
            CodegenGlobals::get_stub_exit_code()
        }
    };

    ocb.unwrap().mark_all_executable();
    cb.mark_all_executable();

    continue_at.raw_ptr()
}

/// Resolve a branch target: link it to an existing compatible block, or
/// emit an outlined stub that compiles the target on first execution.
fn gen_branch_target(
    target_id: BlockId,
    ctx: &Context,
    branchref: &BranchRef,
    target_idx: usize,
    ocb: &mut OutlinedCb,
) -> Option<CodePtr> {
    if let Some(blockref) = find_block_version(target_id, ctx) {
        // Already compiled; link straight to it
        let addr = blockref.borrow().start_addr;
        blockref.borrow_mut().incoming.push(branchref.clone());
        branchref.borrow_mut().targets[target_idx].block = Some(blockref);
        return addr;
    }

    let ocb = ocb.unwrap();
    let stub_addr = ocb.get_write_ptr();

    // The stub carries a raw pointer to its branch. The matching strong
    // count is leaked on purpose; see branch_stub_hit_body.
    let branch_ptr = BranchRef::into_raw(branchref.clone());

    // branch_stub_hit(branch, target_idx, ec), then continue wherever it says
    ocb.mov(C_ARG_REGS[2], REG_EC);
    ocb.mov(C_ARG_REGS[1], Opnd::uimm(target_idx as u64));
    ocb.mov(C_ARG_REGS[0], Opnd::const_ptr(branch_ptr as *const u8));
    ocb.call_ptr(REG0, branch_stub_hit as *const u8);
    ocb.jmp_opnd(RAX);

    if ocb.has_dropped_bytes() {
        None // Out of space for the stub
    } else {
        Some(stub_addr)
    }
}

/// Emit a branch from the current position to up to two targets, each
/// resolved to an existing block or a lazy stub
pub fn gen_branch(
    jit: &JITState,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    target0: BlockId,
    ctx0: &Context,
    target1: Option<BlockId>,
    ctx1: Option<&Context>,
    gen_fn: BranchGenFn,
) {
    assert!(target0 != BLOCKID_NULL);

    let branchref = new_branch(&jit.get_block(), gen_fn);

    let addr0 = gen_branch_target(target0, ctx0, &branchref, 0, ocb);
    let addr1 = match (target1, ctx1) {
        (Some(id), Some(ctx)) => {
            let addr = gen_branch_target(id, ctx, &branchref, 1, ocb);
            if addr.is_none() {
                // A two-way branch can't be emitted with half its targets;
                // leave the dropped-bytes flag to fail the block.
                return;
            }
            addr
        }
        _ => None,
    };

    let mut branch = branchref.borrow_mut();
    branch.targets[0].id = target0;
    branch.targets[0].ctx = *ctx0;
    branch.targets[0].addr = addr0;
    if let (Some(id), Some(ctx)) = (target1, ctx1) {
        branch.targets[1].id = id;
        branch.targets[1].ctx = *ctx;
        branch.targets[1].addr = addr1;
    }

    branch.start_addr = Some(cb.get_write_ptr());
    if let Some(addr0) = addr0 {
        branch.gen_fn.emit(cb, addr0, addr1, branch.shape);
    }
    branch.end_addr = Some(cb.get_write_ptr());
}

/// Jump to a single target block. If it doesn't exist yet, record a
/// fallthrough request so gen_block_series() compiles it right here, and
/// emit nothing at all.
pub fn gen_direct_jump(jit: &JITState, ctx: &Context, target0: BlockId, cb: &mut CodeBlock) {
    assert!(target0 != BLOCKID_NULL);

    let branchref = new_branch(&jit.get_block(), BranchGenFn::Jump);
    let mut branch = branchref.borrow_mut();
    branch.targets[0].id = target0;
    branch.targets[0].ctx = *ctx;

    branch.start_addr = Some(cb.get_write_ptr());

    if let Some(blockref) = find_block_version(target0, ctx) {
        let addr = blockref.borrow().start_addr;
        blockref.borrow_mut().incoming.push(branchref.clone());

        branch.targets[0].block = Some(blockref);
        branch.targets[0].addr = addr;
        branch.shape = BranchShape::Default;
        branch.gen_fn.emit(cb, addr.unwrap(), None, BranchShape::Default);
    } else {
        // Leaving addr unset makes gen_block_series() place the target
        // directly after this block
        branch.shape = BranchShape::Next0;
    }

    branch.end_addr = Some(cb.get_write_ptr());
}

/// Stop compiling here and emit a jump to a stub instead, so this same
/// instruction gets compiled once the first execution arrives and the
/// live receiver/stack can be inspected
pub fn defer_compilation(
    jit: &JITState,
    cur_ctx: &Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) {
    if cur_ctx.chain_depth != 0 {
        panic!("double defer!");
    }

    // The deferred version is distinguished from this one by its depth
    let mut next_ctx = *cur_ctx;
    next_ctx.increment_chain_depth();

    let branchref = new_branch(&jit.get_block(), BranchGenFn::Jump);
    let blockid = BlockId {
        iseq: jit.get_iseq(),
        idx: jit.get_insn_idx(),
    };

    let stub = gen_branch_target(blockid, &next_ctx, &branchref, 0, ocb);

    let mut branch = branchref.borrow_mut();
    branch.targets[0].id = blockid;
    branch.targets[0].ctx = next_ctx;
    branch.targets[0].addr = stub;

    branch.start_addr = Some(cb.get_write_ptr());
    if let Some(stub) = stub {
        branch.gen_fn.emit(cb, stub, None, BranchShape::Default);
    }
    branch.end_addr = Some(cb.get_write_ptr());
}

//===========================================================================
// Removal and invalidation
//===========================================================================

/// Unlink a block from the graph and the assumption registry. The block's
/// storage lives on while branch stubs hold leaked references to it.
pub fn free_block(blockref: &BlockRef) {
    block_assumptions_free(blockref);

    let block = blockref.borrow();

    // Cut the edges that point at us
    for predecessor in &block.incoming {
        let mut branch = predecessor.borrow_mut();
        for target in branch.targets.iter_mut() {
            if target.block.as_ref() == Some(blockref) {
                target.block = None;
            }
        }
    }

    // Take ourselves off our successors' incoming lists
    for branchref in &block.outgoing {
        let branch = branchref.borrow();
        for target in &branch.targets {
            if let Some(successor) = &target.block {
                // A self loop's incoming list dies with the block, and
                // borrowing it here would alias the borrow above
                if successor == blockref {
                    continue;
                }
                successor
                    .borrow_mut()
                    .incoming
                    .retain(|edge| !Rc::ptr_eq(edge, branchref));
            }
        }
    }
}

/// Sanity checks on a block id
pub fn verify_blockid(blockid: BlockId) {
    unsafe {
        assert!(rb_IMEMO_TYPE_P(blockid.iseq.into(), imemo_iseq) != 0);
        assert!(blockid.idx < get_iseq_encoded_size(blockid.iseq));
    }
}

/// Throw away one block version: unhook it from lookups, point every
/// incoming edge at a fresh stub (or an exit), and overwrite its entry
/// with a jump to its exit in case something still lands there.
pub fn invalidate_block_version(blockref: &BlockRef) {
    // Note: assumes the caller holds the VM lock and has run the barrier,
    // so no other thread is mid-instruction in the code we patch.

    let cb = CodegenGlobals::get_inline_cb();
    let ocb = CodegenGlobals::get_outlined_cb();

    // Copy out what we need up front: patching branches below may need to
    // borrow this block again (eg: when a branch loops back into it).
    let (blockid, block_ctx, block_start, block_end, block_exit, incoming) = {
        let block = blockref.borrow();
        (
            block.blockid,
            block.ctx,
            block.start_addr.expect("invalidating unfinished block"),
            block.end_addr.expect("invalidating unfinished block"),
            block.entry_exit.expect("invalidation needs an entry exit"),
            block.incoming.clone(),
        )
    };

    verify_blockid(blockid);

    // No new edges may target this version
    remove_block_version(blockref);

    // Overwrite the entry with a jump to the exit, for any jump we fail to
    // patch below (and for the fallthrough case, where patching the
    // predecessor's branch may scribble over our entry anyway).
    if block_start == block_exit {
        // The block exits straight away; patching would build a jump loop
    } else if block_start >= cb.get_ptr(cb.get_frozen_bytes()) {
        let saved_pos = cb.get_write_pos();
        cb.set_write_ptr(block_start);
        cb.jmp_ptr(block_exit);
        assert!(
            cb.get_write_ptr() < block_end,
            "entry patch exceeded block length"
        );
        cb.set_pos(saved_pos);
    }

    for branchref in &incoming {
        let (target_idx, branch_start) = {
            let mut branch = branchref.borrow_mut();
            let target_idx = if branch.targets[0].addr == Some(block_start) { 0 } else { 1 };
            assert_eq!(branch.targets[target_idx].addr, Some(block_start));
            if let Some(linked) = &branch.targets[target_idx].block {
                assert_eq!(linked, blockref);
            }

            // The edge is no longer linked
            branch.targets[target_idx].block = None;

            (target_idx, branch.start_addr.unwrap())
        };

        // Frozen branches can't be rewritten; the entry patch covers them
        if branch_start < cb.get_ptr(cb.get_frozen_bytes()) {
            continue;
        }

        // Give the edge a fresh stub. If the stub can't be built (OOM),
        // fall back to the block's exit: the branch still must not point
        // into the dead block.
        let new_target = gen_branch_target(blockid, &block_ctx, branchref, target_idx, ocb)
            .unwrap_or(block_exit);

        let mut branch = branchref.borrow_mut();
        branch.targets[target_idx].addr = Some(new_target);

        // A fallthrough edge now needs a real jump
        let was_adjacent = branch.end_addr == Some(block_start);
        if was_adjacent {
            branch.shape = BranchShape::Default;
        }

        let old_size = branch.code_size();
        regenerate_branch(cb, &mut branch);

        if was_adjacent && branch.end_addr.unwrap() > block_end {
            panic!("invalidation patch overran the invalidated block");
        }
        if !was_adjacent && branch.code_size() > old_size {
            panic!("invalidation grew a branch");
        }
    }

    // Entry blocks also need the interpreter to stop calling the jit code
    if blockid.idx == 0 {
        unsafe { rb_iseq_reset_jit_func(blockid.iseq) };
    }

    free_block(blockref);

    ocb.unwrap().mark_all_executable();
    cb.mark_all_executable();

    incr_counter(Counter::invalidation_count);
}

#[cfg(test)]
mod tests {
    use crate::core::*;

    #[test]
    fn type_lattice_diff() {
        // Compatible pairs and their costs
        assert_eq!(Type::Unknown.diff(Type::Unknown), Some(0));
        assert_eq!(Type::Fixnum.diff(Type::Fixnum), Some(0));
        assert_eq!(Type::Fixnum.diff(Type::Unknown), Some(1));
        assert_eq!(Type::Fixnum.diff(Type::UnknownImm), Some(1));
        assert_eq!(Type::Array.diff(Type::UnknownHeap), Some(1));
        assert_eq!(Type::UnknownImm.diff(Type::Unknown), Some(1));

        // Narrowing or crossing the imm/heap split is incompatible
        assert_eq!(Type::Unknown.diff(Type::UnknownImm), None);
        assert_eq!(Type::Unknown.diff(Type::Fixnum), None);
        assert_eq!(Type::Fixnum.diff(Type::UnknownHeap), None);
        assert_eq!(Type::Fixnum.diff(Type::Flonum), None);
        assert_eq!(Type::String.diff(Type::Array), None);
    }

    #[test]
    fn type_lattice_join() {
        assert_eq!(Type::Fixnum.join(Type::Fixnum), Type::Fixnum);
        assert_eq!(Type::Fixnum.join(Type::Flonum), Type::UnknownImm);
        assert_eq!(Type::Array.join(Type::String), Type::UnknownHeap);
        assert_eq!(Type::Fixnum.join(Type::Array), Type::Unknown);

        // Joins are upper bounds: both inputs flow into the result
        let joined = Type::Nil.join(Type::String);
        assert!(Type::Nil.diff(joined).is_some());
        assert!(Type::String.diff(joined).is_some());
    }

    #[test]
    fn context_equivalence() {
        assert_eq!(Context::default().diff(&Context::default()), Some(0));

        // A refined context flows into a general one, not vice versa
        let mut refined = Context::default();
        refined.stack_push(Type::Fixnum);
        let mut general = Context::default();
        general.stack_push(Type::Unknown);
        assert!(refined.diff(&general).is_some());
        assert_eq!(general.diff(&refined), None);
    }

    #[test]
    fn context_stack_geometry() {
        let mut ctx = Context::default();
        ctx.stack_push(Type::Fixnum);
        ctx.stack_push(Type::String);
        assert_eq!(ctx.get_stack_size(), 2);
        assert_eq!(ctx.get_sp_offset(), 2);

        ctx.stack_pop(1);
        assert_eq!(ctx.get_stack_size(), 1);
        assert_eq!(ctx.get_sp_offset(), 1);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Fixnum);

        // A popped slot's type doesn't haunt the next push
        ctx.stack_push(Type::Unknown);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Unknown);
    }

    #[test]
    fn refinement_follows_aliases() {
        let mut ctx = Context::default();
        ctx.stack_push_local(0);

        // Refining the stack copy teaches the local too
        ctx.upgrade_opnd_type(Stack(0), Type::Nil);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Nil);
        assert_eq!(ctx.get_local_type(0), Type::Nil);

        // And self aliases refine self
        let mut ctx = Context::default();
        ctx.stack_push_self();
        ctx.upgrade_opnd_type(Stack(0), Type::String);
        assert_eq!(ctx.get_opnd_type(SelfSlot), Type::String);
    }

    #[test]
    fn local_write_detaches_stale_aliases() {
        let mut ctx = Context::default();
        ctx.set_local_type(0, Type::Fixnum);
        ctx.stack_push_local(0);

        // The stack slot keeps the value (and type) from before the write
        ctx.set_local_type(0, Type::String);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Fixnum);
        assert_eq!(ctx.get_local_type(0), Type::String);
        assert_eq!(ctx.get_opnd_mapping(Stack(0)).0, ToStack);
    }

    #[test]
    fn clearing_locals_downgrades_aliases() {
        let mut ctx = Context::default();
        ctx.set_local_type(0, Type::Fixnum);
        ctx.stack_push_local(0);

        ctx.clear_local_types();
        assert_eq!(ctx.get_local_type(0), Type::Unknown);
        assert_eq!(ctx.get_opnd_mapping(Stack(0)), (ToStack, Type::Fixnum));
    }

    #[test]
    fn chained_contexts_never_deduplicate() {
        let mut chained = Context::default();
        chained.increment_chain_depth();
        assert_eq!(chained.diff(&Context::default()), None);
        assert_eq!(Context::default().diff(&chained), None);
    }

    #[test]
    fn mappings_may_be_forgotten_not_invented() {
        let mut aliased = Context::default();
        aliased.stack_push_self();
        let mut plain = Context::default();
        plain.stack_push(Type::Unknown);

        assert!(aliased.diff(&plain).is_some());
        assert_eq!(plain.diff(&aliased), None);
    }
}
