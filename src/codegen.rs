//! Per-opcode code generation. Each routine consumes the compile-time
//! [Context], emits machine code through the [CodeBlock] facade, and
//! reports whether compilation of the block can continue.

// Opcode constants keep their host VM spelling
#![allow(non_upper_case_globals)]

use crate::asm::x86_64::*;
use crate::asm::*;
use crate::core::*;
use crate::cruby::*;
use crate::invariants::*;
use crate::options::*;
use crate::stats::*;
use crate::utils::*;
use CodegenStatus::*;
use Slot::*;

use std::cmp;
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;

pub use crate::virtualmem::CodePtr;

// Fixed register convention. Three callee-saved registers hold the
// interpreter state we touch constantly; two scratch registers serve
// everything else.
pub const REG_CFP: Opnd = R13;
pub const REG_EC: Opnd = R12;
pub const REG_SP: Opnd = RBX;

pub const REG0: Opnd = RAX;
pub const REG0_32: Opnd = EAX;
pub const REG0_8: Opnd = AL;
pub const REG1: Opnd = RCX;

/// SysV argument registers, in order
pub const C_ARG_REGS: [Opnd; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// Specialized method codegen must leave at least this much room so the
/// tracing invalidation patch (a jmp) fits over it.
pub const JUMP_SIZE_IN_BYTES: usize = 3;

/// What a per-opcode routine tells the block driver
#[derive(PartialEq, Debug)]
enum CodegenStatus {
    KeepCompiling,
    EndBlock,
    CantCompile,
}

/// Signature shared by every per-opcode routine
type InsnGenFn = fn(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus;

/// Compilation state for one block version, alive only while its code is
/// being generated
pub struct JITState {
    /// The block being compiled
    block: BlockRef,

    /// The bytecode being compiled
    iseq: IseqPtr,

    /// Index of the instruction currently being lowered
    insn_idx: u32,

    /// Opcode of that instruction
    opcode: usize,

    /// Its program counter
    pc: *mut VALUE,

    /// Memoized side exit for the current PC. See [side_exit].
    side_exit_for_pc: Option<CodePtr>,

    /// The execution context that requested compilation. Lets deferred
    /// compilation peek at live values.
    ec: Option<EcPtr>,

    /// Set when the previous instruction may call back into the VM, so the
    /// next instruction boundary must be recorded as a patch point for
    /// tracing invalidation
    record_boundary_patch_point: bool,
}

impl JITState {
    pub fn new(blockref: &BlockRef) -> Self {
        JITState {
            block: blockref.clone(),
            iseq: ptr::null(),
            insn_idx: 0,
            opcode: 0,
            pc: ptr::null_mut(),
            side_exit_for_pc: None,
            ec: None,
            record_boundary_patch_point: false,
        }
    }

    pub fn get_block(&self) -> BlockRef {
        self.block.clone()
    }

    pub fn get_iseq(&self) -> IseqPtr {
        self.iseq
    }

    pub fn get_insn_idx(&self) -> u32 {
        self.insn_idx
    }

    pub fn get_opcode(&self) -> usize {
        self.opcode
    }

    pub fn get_pc(&self) -> *mut VALUE {
        self.pc
    }

    /// Fetch an operand of the current instruction
    fn arg(&self, arg_idx: isize) -> VALUE {
        // insn_len isn't available under test
        #[cfg(not(test))]
        assert!(((arg_idx + 1) as u32) < insn_len(self.opcode));
        unsafe { *self.pc.offset(1 + arg_idx) }
    }

    /// Index of the instruction after the current one
    fn next_insn_idx(&self) -> u32 {
        self.insn_idx + insn_len(self.opcode)
    }

    /// True when the interpreter is stopped exactly at the instruction
    /// being compiled, which is what makes run-time values peekable
    fn at_current_insn(&self) -> bool {
        let ec_pc: *mut VALUE = unsafe { get_cfp_pc(get_ec_cfp(self.ec.unwrap())) };
        ec_pc == self.pc
    }

    /// The live value in the nth topmost stack slot (0 = top).
    /// Note: cfp->sp is always flushed before a stub hands control to the
    /// compiler, so no sp_offset correction applies here.
    fn peek_stack(&self, ctx: &Context, n: isize) -> VALUE {
        assert!(self.at_current_insn());
        assert!(n < ctx.get_stack_size() as isize);

        unsafe {
            let sp: *mut VALUE = get_cfp_sp(get_ec_cfp(self.ec.unwrap()));
            *sp.offset(-1 - n)
        }
    }

    /// The live receiver
    fn peek_self(&self) -> VALUE {
        unsafe { get_cfp_self(get_ec_cfp(self.ec.unwrap())) }
    }

    /// The live value of the nth local variable
    fn peek_local(&self, n: i32) -> VALUE {
        assert!(self.at_current_insn());

        let local_count: isize = unsafe { get_iseq_body_local_table_size(self.iseq) }
            .try_into()
            .unwrap();
        assert!((n as isize) < local_count);

        unsafe {
            let ep = get_cfp_ep(get_ec_cfp(self.ec.unwrap()));
            let offs = -(VM_ENV_DATA_SIZE as isize) - local_count + (n as isize) + 1;
            *ep.offset(offs)
        }
    }

    /// Load a VALUE constant into a register. Heap values get their code
    /// offset recorded so the GC can trace and update them.
    fn load_gc_ref(&mut self, cb: &mut CodeBlock, reg: Opnd, val: VALUE) {
        assert!(matches!(reg, Opnd::Reg(_)));
        assert!(reg.num_bits() == 64);

        cb.mov(reg, Opnd::const_ptr(val.as_ptr()));

        if !val.special_const_p() {
            // The value is the trailing 8 bytes of the mov just written
            let offset = (cb.get_write_pos() - SIZEOF_VALUE) as u32;
            self.block.borrow_mut().add_gc_object_offset(offset);
        }
    }

    /// Store the PC of the *next* instruction into the control frame.
    /// Required before anything that can raise or allocate.
    fn save_next_pc(&self, cb: &mut CodeBlock, scratch: Opnd) {
        let next_pc = unsafe { self.pc.offset(insn_len(self.opcode) as isize) };
        cb.mov(scratch, Opnd::const_ptr(next_pc as *const u8));
        cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_PC), scratch);
    }

    /// Everything that must happen before calling a routine that can
    /// allocate, raise, or call back into user code: sync PC and SP, note
    /// the boundary patch point, and distrust the local types.
    fn prepare_routine_call(&mut self, ctx: &mut Context, cb: &mut CodeBlock, scratch: Opnd) {
        self.record_boundary_patch_point = true;
        self.save_next_pc(cb, scratch);
        gen_save_sp(cb, ctx);

        // The callee can write our locals through Binding and friends
        ctx.clear_local_types();
    }
}

/// Write the compile-time SP back into the control frame, realigning the
/// interpreter's view with ours. Invalidates REG_SP-relative operands
/// taken before the call.
fn gen_save_sp(cb: &mut CodeBlock, ctx: &mut Context) {
    if ctx.get_sp_offset() != 0 {
        cb.lea(REG_SP, ctx.sp_opnd(0));
        cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SP), REG_SP);
        ctx.set_sp_offset(0);
    }
}

/// Add an assembly comment if that feature is built in
fn add_comment(cb: &mut CodeBlock, comment_str: &str) {
    if cfg!(feature = "asm_comments") {
        cb.add_comment(comment_str);
    }
}

/// Emit a ractor-safe increment of a profiling counter
#[cfg(feature = "stats")]
fn gen_counter_incr(cb: &mut CodeBlock, counter: Counter) {
    if get_option!(gen_stats) {
        // REG0 may hold a return value here; use REG1
        cb.mov(REG1, Opnd::const_ptr(counter_ptr(counter) as *const u8));
        cb.lock_prefix();
        cb.add(Opnd::mem(64, REG1, 0), Opnd::imm(1));
    }
}
#[cfg(not(feature = "stats"))]
fn gen_counter_incr(_cb: &mut CodeBlock, _counter: Counter) {}

/// A side exit that bumps a counter on the way out, so exits can be
/// attributed. Without stats this is the plain exit.
#[cfg(feature = "stats")]
fn counted_exit(ocb: &mut OutlinedCb, side_exit: CodePtr, counter: Counter) -> CodePtr {
    if !get_option!(gen_stats) {
        return side_exit;
    }

    let ocb = ocb.unwrap();
    let code_ptr = ocb.get_write_ptr();
    gen_counter_incr(ocb, counter);
    ocb.jmp_ptr(side_exit);
    code_ptr
}
#[cfg(not(feature = "stats"))]
fn counted_exit(_ocb: &mut OutlinedCb, side_exit: CodePtr, _counter: Counter) -> CodePtr {
    side_exit
}

/// Record the current inline position as a patch point, to be rewritten
/// into a jump to `exit_pos` when tracing invalidates everything
fn record_global_inval_patch(cb: &CodeBlock, exit_pos: CodePtr) {
    CodegenGlobals::push_global_inval_patch(cb.get_write_ptr(), exit_pos);
}

/// Compare the tracked context against the live stack, self and locals.
/// Enabled by --bbjit-verify-ctx in debug builds.
fn verify_ctx(jit: &JITState, ctx: &Context) {
    fn obj_info_str<'a>(val: VALUE) -> &'a str {
        unsafe { CStr::from_ptr(rb_obj_info(val)).to_str().unwrap() }
    }

    assert!(jit.at_current_insn());

    let self_val = jit.peek_self();
    if Type::from(self_val).diff(ctx.get_opnd_type(SelfSlot)).is_none() {
        panic!(
            "verify_ctx: self type {:?} incompatible with actual self: {}",
            ctx.get_opnd_type(SelfSlot),
            obj_info_str(self_val)
        );
    }

    let tracked = cmp::min(ctx.get_stack_size(), MAX_TEMPS as u16);
    for n in 0..tracked {
        let (mapping, learned) = ctx.get_opnd_mapping(Stack(n));
        let stack_val = jit.peek_stack(ctx, n as isize);

        match mapping {
            SlotMapping::ToSelf => {
                assert!(
                    self_val == stack_val,
                    "verify_ctx: slot claimed to alias self but holds {}",
                    obj_info_str(stack_val),
                );
            }
            SlotMapping::ToLocal(local_idx) => {
                let local_val = jit.peek_local(local_idx.into());
                assert!(
                    local_val == stack_val,
                    "verify_ctx: slot claimed to alias local {} but holds {}",
                    local_idx,
                    obj_info_str(stack_val),
                );
            }
            SlotMapping::ToStack => {}
        }

        if Type::from(stack_val).diff(learned).is_none() {
            panic!(
                "verify_ctx: learned type {:?} incompatible with stack value: {}",
                learned,
                obj_info_str(stack_val)
            );
        }
    }

    let local_count = unsafe { get_iseq_body_local_table_size(jit.iseq) } as usize;
    for i in 0..cmp::min(local_count, MAX_LOCALS) {
        let learned = ctx.get_local_type(i);
        let local_val = jit.peek_local(i as i32);
        if Type::from(local_val).diff(learned).is_none() {
            panic!(
                "verify_ctx: learned type {:?} incompatible with local: {}",
                learned,
                obj_info_str(local_val)
            );
        }
    }
}

/// Emit a transition back to the interpreter: flush SP, store the exit PC,
/// restore the callee-saved registers and return Qundef so the interpreter
/// resumes at that PC.
fn gen_exit(exit_pc: *mut VALUE, ctx: &Context, cb: &mut CodeBlock) -> CodePtr {
    let code_ptr = cb.get_write_ptr();

    add_comment(cb, "exit to interpreter");

    if ctx.get_sp_offset() != 0 {
        cb.lea(REG_SP, ctx.sp_opnd(0));
        cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SP), REG_SP);
    }

    cb.mov(RAX, Opnd::const_ptr(exit_pc as *const u8));
    cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_PC), RAX);

    // Tally which opcode we bailed on
    #[cfg(feature = "stats")]
    if get_option!(gen_stats) {
        cb.mov(RDI, Opnd::const_ptr(exit_pc as *const u8));
        cb.call_ptr(RSI, rb_bbjit_count_side_exit_op as *const u8);
    }

    cb.pop(REG_SP);
    cb.pop(REG_EC);
    cb.pop(REG_CFP);

    cb.mov(RAX, Opnd::uimm(Qundef.into()));
    cb.ret();

    code_ptr
}

/// The shared exit used when a branch stub can't produce code. The stub
/// has already restored PC and SP; all that's left is to pop our frame.
fn gen_stub_exit(ocb: &mut OutlinedCb) -> CodePtr {
    let ocb = ocb.unwrap();
    let code_ptr = ocb.get_write_ptr();

    gen_counter_incr(ocb, Counter::exit_from_branch_stub);

    ocb.pop(REG_SP);
    ocb.pop(REG_EC);
    ocb.pop(REG_CFP);

    ocb.mov(RAX, Opnd::uimm(Qundef.into()));
    ocb.ret();

    code_ptr
}

/// The memoized outlined exit for the current instruction. Guards jump
/// here when they fail.
///
/// Note that the exit encodes the entry state of the instruction: it must
/// be requested before any context push/pop for the restored interpreter
/// state to be right.
fn side_exit(jit: &mut JITState, ocb: &mut OutlinedCb, ctx: &Context) -> CodePtr {
    if jit.side_exit_for_pc.is_none() {
        jit.side_exit_for_pc = Some(gen_exit(jit.pc, ctx, ocb.unwrap()));
    }
    jit.side_exit_for_pc.unwrap()
}

/// Make sure the block has an exit matching its entry context.
/// Invalidation patches jumps to this exit, so any block registering
/// assumptions needs one.
pub fn jit_ensure_block_entry_exit(jit: &mut JITState, ocb: &mut OutlinedCb) {
    let blockref = jit.get_block();
    if blockref.borrow().entry_exit.is_some() {
        return;
    }

    let block_ctx = blockref.borrow().get_ctx();
    let blockid = blockref.borrow().get_blockid();

    let exit = if jit.insn_idx == blockid.idx {
        // Compiling the first instruction; share its cached exit
        side_exit(jit, ocb, &block_ctx)
    } else {
        let pc = unsafe { rb_iseq_pc_at_idx(blockid.iseq, blockid.idx) };
        gen_exit(pc, &block_ctx, ocb.unwrap())
    };
    blockref.borrow_mut().entry_exit = Some(exit);
}

/// Landing pad used once c_return tracing turns on: fire the event the
/// compiled call never would, then exit. Expects REG_EC live and the C
/// return value in RAX.
fn gen_full_cfunc_return(ocb: &mut OutlinedCb) -> CodePtr {
    let ocb = ocb.unwrap();
    let code_ptr = ocb.get_write_ptr();

    ocb.mov(C_ARG_REGS[0], REG_EC);
    ocb.mov(C_ARG_REGS[1], RAX);
    ocb.call_ptr(REG0, rb_bbjit_full_cfunc_return as *const u8);

    gen_counter_incr(ocb, Counter::traced_cfunc_return);

    ocb.pop(REG_SP);
    ocb.pop(REG_EC);
    ocb.pop(REG_CFP);

    ocb.mov(RAX, Opnd::uimm(Qundef.into()));
    ocb.ret();

    code_ptr
}

/// Where `leave` lands when returning to the interpreter rather than to
/// compiled code. The return value is already in RAX and interpreter
/// state is already restored; just unwind our native frame.
fn gen_leave_exit(ocb: &mut OutlinedCb) -> CodePtr {
    let ocb = ocb.unwrap();
    let code_ptr = ocb.get_write_ptr();

    gen_counter_incr(ocb, Counter::leave_interp_return);

    ocb.pop(REG_SP);
    ocb.pop(REG_EC);
    ocb.pop(REG_CFP);

    ocb.ret();

    code_ptr
}

/// Guard that the interpreter entered where we compiled for. Optional
/// parameters make a method enterable at several PCs, and each compiled
/// entry point only covers one of them.
fn gen_pc_guard(cb: &mut CodeBlock, iseq: IseqPtr, insn_idx: u32) {
    let expected_pc = unsafe { rb_iseq_pc_at_idx(iseq, insn_idx) };

    cb.mov(REG0, Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_PC));
    cb.mov(REG1, Opnd::const_ptr(expected_pc as *const u8));
    cb.cmp(REG0, REG1);

    let pc_match = cb.new_label("pc_match");
    cb.jcc_label(Cc::E, pc_match);

    // Wrong entry point; let the interpreter run this call
    gen_counter_incr(cb, Counter::leave_start_pc_non_zero);

    cb.pop(REG_SP);
    cb.pop(REG_EC);
    cb.pop(REG_CFP);

    cb.mov(RAX, Opnd::uimm(Qundef.into()));
    cb.ret();

    cb.write_label(pc_match);
    cb.link_labels();
}

/// Compile the per-iseq prologue the interpreter calls into: save the
/// callee-saved registers we take over, load EC/CFP/SP, and route the
/// eventual return back to the interpreter.
pub fn gen_entry_prologue(cb: &mut CodeBlock, iseq: IseqPtr, insn_idx: u32) -> Option<CodePtr> {
    const MAX_PROLOGUE_SIZE: usize = 1024;

    if !cb.has_capacity(MAX_PROLOGUE_SIZE) {
        return None;
    }
    let old_write_pos = cb.get_write_pos();

    // Cache-align entry points
    cb.align_pos(64);
    let code_ptr = cb.get_write_ptr();
    add_comment(cb, "jit entry");

    cb.push(REG_CFP);
    cb.push(REG_EC);
    cb.push(REG_SP);

    // The JIT call ABI passes EC and CFP
    cb.mov(REG_EC, C_ARG_REGS[0]);
    cb.mov(REG_CFP, C_ARG_REGS[1]);
    cb.mov(REG_SP, Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SP));

    // A plain `leave` in this frame returns to the interpreter
    cb.mov(REG0, Opnd::code_ptr(CodegenGlobals::get_leave_exit_code()));
    cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_JIT_RETURN), REG0);

    // Optional parameters can divert the starting PC; check it
    if unsafe { get_iseq_flags_has_opt(iseq) } {
        gen_pc_guard(cb, iseq, insn_idx);
    }

    assert!(cb.get_write_pos() - old_write_pos <= MAX_PROLOGUE_SIZE);

    Some(code_ptr)
}

/// Take a side exit if any interrupt is pending. Clobbers REG0.
fn gen_check_ints(cb: &mut CodeBlock, side_exit: CodePtr) {
    add_comment(cb, "check for interrupts");

    // Flag bits not covered by the mask mean a pending interrupt
    cb.mov(REG0_32, Opnd::mem(32, REG_EC, RUBY_OFFSET_EC_INTERRUPT_MASK));
    cb.not(REG0_32);
    cb.test(Opnd::mem(32, REG_EC, RUBY_OFFSET_EC_INTERRUPT_FLAG), REG0_32);
    cb.jcc_ptr(Cc::NE, side_exit);
}

/// End the block with a jump to the next instruction, routed through the
/// branch machinery so the versions of a guard chain share one successor.
/// Also where a pending boundary patch point gets recorded.
fn jump_to_next_insn(
    jit: &mut JITState,
    current_context: &Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) {
    // Chain depth is a per-instruction concept; successors start fresh
    let mut reset_depth = *current_context;
    reset_depth.reset_chain_depth();

    let jump_block = BlockId {
        iseq: jit.iseq,
        idx: jit.next_insn_idx(),
    };

    if jit.record_boundary_patch_point {
        let exit_pc = unsafe { jit.pc.offset(insn_len(jit.opcode) as isize) };
        let exit_pos = gen_exit(exit_pc, &reset_depth, ocb.unwrap());
        record_global_inval_patch(cb, exit_pos);
        jit.record_boundary_patch_point = false;
    }

    gen_direct_jump(jit, &reset_depth, jump_block, cb);
}

/// Compile one block version: walk instructions from the entry position,
/// dispatching to the per-opcode routines, until one of them ends the
/// block or refuses.
///
/// The context mutates as compilation advances; `start_ctx` itself is the
/// immutable entry state.
pub fn gen_single_block(
    blockid: BlockId,
    start_ctx: &Context,
    ec: EcPtr,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> Result<BlockRef, ()> {
    // A nearly-full arena is fatal. Refusing up front is what guarantees
    // no partially emitted block ever becomes reachable.
    if !cb.has_capacity(1024) {
        unsafe { rb_bug(b"bbjit: out of executable memory\0".as_ptr() as *const c_char) };
    }

    // Enforce the per-position version cap
    let mut ctx = limit_block_versions(blockid, start_ctx);

    verify_blockid(blockid);
    assert!(!(blockid.idx == 0 && ctx.get_stack_size() > 0));

    let iseq = blockid.iseq;
    let iseq_size = unsafe { get_iseq_encoded_size(iseq) };
    let mut insn_idx = blockid.idx;

    let blockref = Block::new(blockid, &ctx);
    let mut jit = JITState::new(&blockref);
    jit.iseq = iseq;
    jit.ec = Some(ec);

    blockref.borrow_mut().set_start_addr(cb.get_write_ptr());

    while insn_idx < iseq_size {
        let pc = unsafe { rb_iseq_pc_at_idx(iseq, insn_idx) };
        let opcode: usize = unsafe { rb_iseq_opcode_at_pc(iseq, pc) }.try_into().unwrap();

        // opt_getinlinecache needs a block of its own so the whole block
        // can be invalidated when the cache fills. Split in front of it.
        if opcode == YARVINSN_opt_getinlinecache.as_usize() && insn_idx > blockid.idx {
            jump_to_next_insn(&mut jit, &ctx, cb, ocb);
            break;
        }

        jit.insn_idx = insn_idx;
        jit.opcode = opcode;
        jit.pc = pc;
        jit.side_exit_for_pc = None;

        // A boundary requested by the previous instruction lands here
        if jit.record_boundary_patch_point {
            let exit_pos = gen_exit(pc, &ctx, ocb.unwrap());
            record_global_inval_patch(cb, exit_pos);
            jit.record_boundary_patch_point = false;
        }

        // Self-check the tracked types against the live frame
        if cfg!(debug_assertions) && get_option!(verify_ctx) && jit.at_current_insn() {
            verify_ctx(&jit, &ctx);
        }

        let status = match get_gen_fn(VALUE(opcode)) {
            Some(gen_fn) => {
                // Count instructions that execute through compiled code.
                // This gets bumped even when the path later side-exits.
                gen_counter_incr(cb, Counter::exec_instruction);
                add_comment(cb, &insn_name(opcode));

                if get_option!(dump_insns) {
                    println!("compiling {}", insn_name(opcode));
                }

                gen_fn(&mut jit, &mut ctx, cb, ocb)
            }
            // Opcode the JIT doesn't know; hand the PC to the interpreter
            None => CantCompile,
        };

        if status == CantCompile {
            // Exit at *this* instruction, which hasn't executed yet.
            //
            // TODO: if the routine mutated ctx before refusing, this exit
            // would restore the wrong state. We could snapshot ctx per
            // instruction and assert it is unchanged here.
            let exit = gen_exit(jit.pc, &ctx, cb);

            // A refusal on the very first instruction doubles as the
            // block's invalidation exit
            let mut block = blockref.borrow_mut();
            if insn_idx == blockid.idx {
                block.entry_exit = Some(exit);
            }
            break;
        }

        // Chain depth only concerns re-compilations of one instruction
        ctx.reset_chain_depth();

        insn_idx += insn_len(opcode);

        if status == EndBlock {
            break;
        }
    }

    // Seal the block's ranges
    {
        let mut block = blockref.borrow_mut();
        block.set_end_addr(cb.get_write_ptr());
        block.set_end_idx(insn_idx);
    }

    // Anything dropped on the floor poisons the whole block
    if cb.has_dropped_bytes() || ocb.unwrap().has_dropped_bytes() {
        return Err(());
    }

    Ok(blockref)
}

//===========================================================================
// Stack shuffling and literal pushes
//===========================================================================

fn gen_nop(
    _jit: &mut JITState,
    _ctx: &mut Context,
    _cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    KeepCompiling
}

fn gen_pop(
    _jit: &mut JITState,
    ctx: &mut Context,
    _cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // Pure bookkeeping; nothing to emit
    ctx.stack_pop(1);
    KeepCompiling
}

fn gen_adjuststack(
    jit: &mut JITState,
    ctx: &mut Context,
    _cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let n = jit.arg(0).as_usize();
    ctx.stack_pop(n);
    KeepCompiling
}

fn gen_dup(
    _jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let src = ctx.stack_opnd(0);
    let (mapping, ty) = ctx.get_opnd_mapping(Stack(0));

    // The copy shares the original's origin, so refinements reach both
    let dst = ctx.stack_push_mapping(mapping, ty);
    cb.mov(REG0, src);
    cb.mov(dst, REG0);

    KeepCompiling
}

// Duplicate the top n stack entries
fn gen_dupn(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // The compiler only emits this with n == 2
    if jit.arg(0).as_usize() != 2 {
        return CantCompile;
    }

    let src1 = ctx.stack_opnd(1);
    let src0 = ctx.stack_opnd(0);
    let (map1, ty1) = ctx.get_opnd_mapping(Stack(1));
    let (map0, ty0) = ctx.get_opnd_mapping(Stack(0));

    let dst1 = ctx.stack_push_mapping(map1, ty1);
    cb.mov(REG0, src1);
    cb.mov(dst1, REG0);

    let dst0 = ctx.stack_push_mapping(map0, ty0);
    cb.mov(REG0, src0);
    cb.mov(dst0, REG0);

    KeepCompiling
}

/// Exchange two stack slots, values and tracking both
fn stack_swap(ctx: &mut Context, cb: &mut CodeBlock, n0: u16, n1: u16) {
    let opnd0 = ctx.stack_opnd(n0 as i32);
    let opnd1 = ctx.stack_opnd(n1 as i32);

    let info0 = ctx.get_opnd_mapping(Stack(n0));
    let info1 = ctx.get_opnd_mapping(Stack(n1));

    cb.mov(REG0, opnd0);
    cb.mov(REG1, opnd1);
    cb.mov(opnd0, REG1);
    cb.mov(opnd1, REG0);

    ctx.set_opnd_mapping(Stack(n0), info1);
    ctx.set_opnd_mapping(Stack(n1), info0);
}

fn gen_swap(
    _jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    stack_swap(ctx, cb, 0, 1);
    KeepCompiling
}

// Copy the top of the stack into the nth slot below it
fn gen_setn(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let n: u16 = jit.arg(0).as_usize().try_into().unwrap();

    cb.mov(REG0, ctx.stack_opnd(0));
    cb.mov(ctx.stack_opnd(n as i32), REG0);

    let top_info = ctx.get_opnd_mapping(Stack(0));
    ctx.set_opnd_mapping(Stack(n), top_info);

    KeepCompiling
}

// Push a copy of the nth slot from the top
fn gen_topn(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let n: u16 = jit.arg(0).as_usize().try_into().unwrap();

    let src = ctx.stack_opnd(n as i32);
    let (mapping, ty) = ctx.get_opnd_mapping(Stack(n));

    let dst = ctx.stack_push_mapping(mapping, ty);
    cb.mov(REG0, src);
    cb.mov(dst, REG0);

    KeepCompiling
}

/// Push one literal value, tracked at its precise lattice type. Wide
/// immediates go through a register; heap constants additionally get
/// their code offset recorded for the GC.
fn jit_putobject(jit: &mut JITState, ctx: &mut Context, cb: &mut CodeBlock, val: VALUE) {
    let dst = ctx.stack_push(Type::from(val));

    if !val.special_const_p() {
        jit.load_gc_ref(cb, REG0, val);
        cb.mov(dst, REG0);
    } else if i32::try_from(val.as_i64()).is_ok() {
        // Immediates never move, and a small one can go straight to memory
        cb.mov(dst, Opnd::imm(val.as_i64()));
    } else {
        cb.mov(REG0, Opnd::imm(val.as_i64()));
        cb.mov(dst, REG0);
    }
}

fn gen_putnil(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    jit_putobject(jit, ctx, cb, Qnil);
    KeepCompiling
}

fn gen_putobject(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let val = jit.arg(0);
    jit_putobject(jit, ctx, cb, val);
    KeepCompiling
}

fn gen_putobject_int2fix(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let cst_val = if jit.opcode == YARVINSN_putobject_INT2FIX_0_.as_usize() {
        0
    } else {
        1
    };
    jit_putobject(jit, ctx, cb, VALUE::fixnum_from_usize(cst_val));
    KeepCompiling
}

fn gen_putself(
    _jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    cb.mov(REG0, Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SELF));

    // The slot aliases self, so guards on either refine both
    let dst = ctx.stack_push_self();
    cb.mov(dst, REG0);

    KeepCompiling
}

fn gen_putspecialobject(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // Only the frozen-core object is compiled; cbase lookups walk the
    // lexical scope and stay in the interpreter
    if jit.arg(0).as_usize() != VM_SPECIAL_OBJECT_VMCORE.as_usize() {
        return CantCompile;
    }

    let dst = ctx.stack_push(Type::UnknownHeap);
    let frozen_core = unsafe { rb_mRubyVMFrozenCore };
    jit.load_gc_ref(cb, REG0, frozen_core);
    cb.mov(dst, REG0);

    KeepCompiling
}

fn gen_putstring(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let put_val = jit.arg(0);

    // The callee allocates a fresh string
    jit.prepare_routine_call(ctx, cb, REG0);

    cb.mov(C_ARG_REGS[0], REG_EC);
    jit.load_gc_ref(cb, C_ARG_REGS[1], put_val);
    cb.call_ptr(REG0, rb_ec_str_resurrect as *const u8);

    let dst = ctx.stack_push(Type::String);
    cb.mov(dst, RAX);

    KeepCompiling
}

//===========================================================================
// Local variable access
//===========================================================================

/// The iseq stores locals as EP-relative slots counted down from the
/// environment data words; convert a slot operand to a local table index.
fn slot_to_local_idx(iseq: IseqPtr, slot_idx: i32) -> u32 {
    // ep[-slot_idx] is the local; local 0 sits lowest in memory:
    //   [local 0][local 1]...[local n][VM_ENV_DATA_SIZE words] <- ep
    let local_table_size: i32 = unsafe { get_iseq_body_local_table_size(iseq) }
        .try_into()
        .unwrap();
    let local_idx = local_table_size - (slot_idx - VM_ENV_DATA_SIZE as i32) - 1;
    assert!((0..local_table_size).contains(&local_idx));
    local_idx as u32
}

/// Load the environment pointer for a lexical level into `reg`, chasing
/// the parent-environment slot with its tag bits stripped
fn gen_get_ep(cb: &mut CodeBlock, reg: Opnd, level: u32) {
    cb.mov(reg, Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_EP));

    for _ in 0..level {
        // See GET_PREV_EP: the specval slot holds the parent EP with two
        // low tag bits
        let specval = Opnd::mem(64, reg, SIZEOF_VALUE_I32 * VM_ENV_DATA_INDEX_SPECVAL);
        cb.mov(reg, specval);
        cb.and(reg, Opnd::imm(!0x03));
    }
}

fn gen_getlocal_level(
    ctx: &mut Context,
    cb: &mut CodeBlock,
    slot_idx: i32,
    level: u32,
) -> CodegenStatus {
    gen_get_ep(cb, REG0, level);
    cb.mov(REG0, Opnd::mem(64, REG0, -SIZEOF_VALUE_I32 * slot_idx));

    // Only same-frame locals can be tracked through an alias; outer
    // frames can change underneath us
    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, REG0);

    KeepCompiling
}

fn gen_getlocal(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let slot_idx = jit.arg(0).as_i32();
    let level = jit.arg(1).as_u32();
    gen_getlocal_level(ctx, cb, slot_idx, level)
}

fn gen_getlocal_wc1(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let slot_idx = jit.arg(0).as_i32();
    gen_getlocal_level(ctx, cb, slot_idx, 1)
}

fn gen_getlocal_wc0(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let slot_idx = jit.arg(0).as_i32();
    let local_idx = slot_to_local_idx(jit.get_iseq(), slot_idx);

    gen_get_ep(cb, REG0, 0);
    cb.mov(REG0, Opnd::mem(64, REG0, -SIZEOF_VALUE_I32 * slot_idx));

    // Same-frame read: the slot aliases the local and sees its type
    let dst = ctx.stack_push_local(local_idx.as_usize());
    cb.mov(dst, REG0);

    KeepCompiling
}

/// Store the stack top into a local. Writes into environments that have
/// escaped to the heap need a write barrier, which we don't carry; the
/// WB-required flag makes those frames side exit.
fn gen_setlocal_level(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    slot_idx: i32,
    level: u32,
) -> CodegenStatus {
    gen_get_ep(cb, REG0, level);

    let flags = Opnd::mem(64, REG0, SIZEOF_VALUE_I32 * VM_ENV_DATA_INDEX_FLAGS);
    cb.test(flags, Opnd::imm(VM_ENV_FLAG_WB_REQUIRED as i64));

    let exit = side_exit(jit, ocb, ctx);
    cb.jcc_ptr(Cc::NE, exit);

    if level == 0 {
        // Track the written type on the local
        let ty = ctx.get_opnd_type(Stack(0));
        ctx.set_local_type(slot_to_local_idx(jit.get_iseq(), slot_idx).as_usize(), ty);
    }

    let val = ctx.stack_pop(1);
    cb.mov(REG1, val);
    cb.mov(Opnd::mem(64, REG0, -SIZEOF_VALUE_I32 * slot_idx), REG1);

    KeepCompiling
}

fn gen_setlocal_wc0(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let slot_idx = jit.arg(0).as_i32();
    gen_setlocal_level(jit, ctx, cb, ocb, slot_idx, 0)
}

fn gen_setlocal_wc1(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let slot_idx = jit.arg(0).as_i32();
    gen_setlocal_level(jit, ctx, cb, ocb, slot_idx, 1)
}

fn gen_setlocal(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let slot_idx = jit.arg(0).as_i32();
    let level = jit.arg(1).as_u32();
    gen_setlocal_level(jit, ctx, cb, ocb, slot_idx, level)
}

//===========================================================================
// Array, hash, range and string constructors
//===========================================================================

fn gen_newarray(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let n = jit.arg(0).as_u32();

    // Allocates
    jit.prepare_routine_call(ctx, cb, REG0);

    // The source values sit contiguously below the (synced) SP
    let values_ptr = ctx.sp_opnd(-((SIZEOF_VALUE as isize) * (n as isize)));

    cb.mov(C_ARG_REGS[0], REG_EC);
    cb.mov(C_ARG_REGS[1], Opnd::imm(n.into()));
    cb.lea(C_ARG_REGS[2], values_ptr);
    cb.call_ptr(REG0, rb_ec_ary_new_from_values as *const u8);

    ctx.stack_pop(n.as_usize());
    let dst = ctx.stack_push(Type::Array);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_duparray(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let ary = jit.arg(0);

    // Allocates
    jit.prepare_routine_call(ctx, cb, REG0);

    jit.load_gc_ref(cb, C_ARG_REGS[0], ary);
    cb.call_ptr(REG0, rb_ary_resurrect as *const u8);

    let dst = ctx.stack_push(Type::Array);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_duphash(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let hash = jit.arg(0);

    // Allocates
    jit.prepare_routine_call(ctx, cb, REG0);

    jit.load_gc_ref(cb, C_ARG_REGS[0], hash);
    cb.call_ptr(REG0, rb_hash_resurrect as *const u8);

    let dst = ctx.stack_push(Type::Hash);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_newhash(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let num: i64 = jit.arg(0).as_i64();

    // Allocates
    jit.prepare_routine_call(ctx, cb, REG0);

    if num == 0 {
        cb.call_ptr(REG0, rb_hash_new as *const u8);

        let dst = ctx.stack_push(Type::Hash);
        cb.mov(dst, RAX);
        return KeepCompiling;
    }

    // Make the hash ahead of time, then bulk-insert the key/value pairs
    // still sitting on the stack
    cb.mov(C_ARG_REGS[0], Opnd::imm(num / 2));
    cb.call_ptr(REG0, rb_hash_new_with_size as *const u8);

    // Hold the new hash across the insert call (twice for alignment)
    cb.push(RAX);
    cb.push(RAX);

    cb.mov(C_ARG_REGS[0], Opnd::imm(num));
    cb.lea(C_ARG_REGS[1], ctx.stack_opnd((num - 1) as i32));
    cb.mov(C_ARG_REGS[2], RAX);
    cb.call_ptr(REG0, rb_hash_bulk_insert as *const u8);

    cb.pop(RAX);
    cb.pop(RAX);

    ctx.stack_pop(num as usize);
    let dst = ctx.stack_push(Type::Hash);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_newrange(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let flag = jit.arg(0);

    // Allocates and can raise on bad operands
    jit.prepare_routine_call(ctx, cb, REG0);

    cb.mov(C_ARG_REGS[0], ctx.stack_opnd(1));
    cb.mov(C_ARG_REGS[1], ctx.stack_opnd(0));
    cb.mov(C_ARG_REGS[2], Opnd::uimm(flag.into()));
    cb.call_ptr(REG0, rb_range_new as *const u8);

    ctx.stack_pop(2);
    let dst = ctx.stack_push(Type::UnknownHeap);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_splatarray(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let flag = jit.arg(0);

    // May call #to_a and allocate. Syncing first also fixes REG_SP.
    jit.prepare_routine_call(ctx, cb, REG0);

    let ary = ctx.stack_pop(1);
    jit.load_gc_ref(cb, C_ARG_REGS[0], flag);
    cb.mov(C_ARG_REGS[1], ary);
    cb.call_ptr(REG1, rb_vm_splat_array as *const u8);

    let dst = ctx.stack_push(Type::Array);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_concatstrings(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let n = jit.arg(0);

    // Allocates the result string
    jit.prepare_routine_call(ctx, cb, REG0);

    let strings_ptr = ctx.sp_opnd(-((SIZEOF_VALUE as isize) * n.as_isize()));
    cb.mov(C_ARG_REGS[0], Opnd::imm(n.into()));
    cb.lea(C_ARG_REGS[1], strings_ptr);
    cb.call_ptr(REG0, rb_str_concat_literals as *const u8);

    ctx.stack_pop(n.as_usize());
    let dst = ctx.stack_push(Type::String);
    cb.mov(dst, RAX);

    KeepCompiling
}

//===========================================================================
// Inline guards
//===========================================================================

/// Bail to the side exit unless the operand holds a heap object
fn guard_object_is_heap(cb: &mut CodeBlock, object: Opnd, side_exit: CodePtr) {
    add_comment(cb, "guard object is heap");

    // Immediate tag bits set?
    cb.test(object, Opnd::uimm(RUBY_IMMEDIATE_MASK as u64));
    cb.jcc_ptr(Cc::NE, side_exit);

    // Qfalse and Qnil are the only remaining non-heap patterns
    cb.cmp(object, Opnd::uimm(Qnil.into()));
    cb.jcc_ptr(Cc::BE, side_exit);
}

/// Bail to the side exit unless the (heap) object is a T_ARRAY.
/// Clobbers `flags_scratch`.
fn guard_object_is_array(cb: &mut CodeBlock, object: Opnd, flags_scratch: Opnd, side_exit: CodePtr) {
    add_comment(cb, "guard object is array");

    cb.mov(flags_scratch, Opnd::mem(64, object, RUBY_OFFSET_RBASIC_FLAGS));
    cb.and(flags_scratch, Opnd::uimm(RUBY_T_MASK as u64));
    cb.cmp(flags_scratch, Opnd::uimm(RUBY_T_ARRAY as u64));
    cb.jcc_ptr(Cc::NE, side_exit);
}

/// Guard that the two topmost values are fixnums, refining their types.
/// Emission is skipped for slots already known to be fixnums, and slots
/// known to be anything else jump straight to the exit.
fn guard_two_fixnums(ctx: &mut Context, cb: &mut CodeBlock, side_exit: CodePtr) {
    let ty1 = ctx.get_opnd_type(Stack(0));
    let ty0 = ctx.get_opnd_type(Stack(1));

    if ty0.is_heap() || ty1.is_heap() {
        add_comment(cb, "arg is heap object");
        cb.jmp_ptr(side_exit);
        return;
    }
    if (ty0.is_specific() && ty0 != Type::Fixnum) || (ty1.is_specific() && ty1 != Type::Fixnum) {
        add_comment(cb, "arg is known non-fixnum");
        cb.jmp_ptr(side_exit);
        return;
    }

    if ty0 != Type::Fixnum {
        add_comment(cb, "guard arg0 fixnum");
        cb.test(ctx.stack_opnd(1), Opnd::uimm(RUBY_FIXNUM_FLAG as u64));
        cb.jcc_ptr(Cc::E, side_exit);
    }
    if ty1 != Type::Fixnum {
        add_comment(cb, "guard arg1 fixnum");
        cb.test(ctx.stack_opnd(0), Opnd::uimm(RUBY_FIXNUM_FLAG as u64));
        cb.jcc_ptr(Cc::E, side_exit);
    }

    // Passing the guards proves both types
    ctx.upgrade_opnd_type(Stack(0), Type::Fixnum);
    ctx.upgrade_opnd_type(Stack(1), Type::Fixnum);
}

// Chain depth caps per call site kind
pub const GET_IVAR_MAX_DEPTH: i32 = 10; // up to 5 classes, embedded or not for each
pub const OPT_AREF_MAX_CHAIN_DEPTH: i32 = 2; // hashes and arrays
pub const SEND_MAX_DEPTH: i32 = 5; // up to 5 receiver classes

/// A guard inside a polymorphic chain: while the chain is below its depth
/// cap, a failing check branches to a stub that compiles this same
/// instruction again, one link deeper, against the class it then observes.
/// At the cap, failures just exit. `cc` is the condition of failure.
fn jit_chain_guard(
    cc: Cc,
    jit: &JITState,
    ctx: &Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    depth_limit: i32,
    side_exit: CodePtr,
) {
    if (ctx.get_chain_depth() as i32) < depth_limit {
        let mut deeper = *ctx;
        deeper.increment_chain_depth();
        let bid = BlockId {
            iseq: jit.iseq,
            idx: jit.insn_idx,
        };

        gen_branch(jit, cb, ocb, bid, &deeper, None, None, BranchGenFn::Guard(cc));
    } else {
        cb.jcc_ptr(cc, side_exit);
    }
}

/// Guard that the value in REG0 (tracked as `slot`) is an instance of
/// `known_klass`, using the sample instance to pick the cheapest check:
/// tag tests for the immediate classes, an identity compare for singleton
/// classes, a class-field compare for everything on the heap. Passing
/// refines the slot's type.
fn jit_guard_known_klass(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    known_klass: VALUE,
    slot: Slot,
    sample_instance: VALUE,
    max_chain_depth: i32,
    side_exit: CodePtr,
) {
    let val_type = ctx.get_opnd_type(slot);

    if unsafe { known_klass == rb_cNilClass } {
        assert!(!val_type.is_heap());
        if val_type != Type::Nil {
            assert!(val_type.is_unknown());

            add_comment(cb, "guard object is nil");
            cb.cmp(REG0, Opnd::imm(Qnil.into()));
            jit_chain_guard(Cc::NE, jit, ctx, cb, ocb, max_chain_depth, side_exit);

            ctx.upgrade_opnd_type(slot, Type::Nil);
        }
    } else if unsafe { known_klass == rb_cTrueClass } {
        assert!(!val_type.is_heap());
        if val_type != Type::True {
            assert!(val_type.is_unknown());

            add_comment(cb, "guard object is true");
            cb.cmp(REG0, Opnd::imm(Qtrue.into()));
            jit_chain_guard(Cc::NE, jit, ctx, cb, ocb, max_chain_depth, side_exit);

            ctx.upgrade_opnd_type(slot, Type::True);
        }
    } else if unsafe { known_klass == rb_cFalseClass } {
        assert!(!val_type.is_heap());
        if val_type != Type::False {
            assert!(val_type.is_unknown());

            add_comment(cb, "guard object is false");
            assert!(Qfalse.as_i32() == 0);
            cb.test(REG0, REG0);
            jit_chain_guard(Cc::NE, jit, ctx, cb, ocb, max_chain_depth, side_exit);

            ctx.upgrade_opnd_type(slot, Type::False);
        }
    } else if unsafe { known_klass == rb_cInteger } && sample_instance.fixnum_p() {
        // Fixnums and bignums are guarded as if they had distinct classes;
        // a bignum sample takes the generic heap path below
        assert!(!val_type.is_heap());
        if val_type != Type::Fixnum {
            assert!(val_type.is_unknown());

            add_comment(cb, "guard object is fixnum");
            cb.test(REG0, Opnd::imm(RUBY_FIXNUM_FLAG as i64));
            jit_chain_guard(Cc::E, jit, ctx, cb, ocb, max_chain_depth, side_exit);

            ctx.upgrade_opnd_type(slot, Type::Fixnum);
        }
    } else if unsafe { known_klass == rb_cSymbol } && sample_instance.static_sym_p() {
        // Static and dynamic symbols likewise split into two guard kinds
        assert!(!val_type.is_heap());
        if val_type != Type::ImmSymbol {
            assert!(val_type.is_unknown());

            add_comment(cb, "guard object is static symbol");
            assert!(RUBY_SPECIAL_SHIFT == 8);
            cb.cmp(REG0_8, Opnd::uimm(RUBY_SYMBOL_FLAG as u64));
            jit_chain_guard(Cc::NE, jit, ctx, cb, ocb, max_chain_depth, side_exit);

            ctx.upgrade_opnd_type(slot, Type::ImmSymbol);
        }
    } else if unsafe { known_klass == rb_cFloat } && sample_instance.flonum_p() {
        // Flonum vs heap float, same split
        assert!(!val_type.is_heap());
        if val_type != Type::Flonum {
            assert!(val_type.is_unknown());

            add_comment(cb, "guard object is flonum");
            cb.mov(REG1, REG0);
            cb.and(REG1, Opnd::uimm(RUBY_FLONUM_MASK as u64));
            cb.cmp(REG1, Opnd::uimm(RUBY_FLONUM_FLAG as u64));
            jit_chain_guard(Cc::NE, jit, ctx, cb, ocb, max_chain_depth, side_exit);

            ctx.upgrade_opnd_type(slot, Type::Flonum);
        }
    } else if unsafe {
        FL_TEST(known_klass, VALUE(RUBY_FL_SINGLETON as usize)) != VALUE(0)
            && sample_instance == rb_attr_get(known_klass, id__attached__)
    } {
        // A singleton class has exactly one instance, so comparing against
        // that object is both the cheapest and the strictest check.
        // (A sample whose singleton class isn't attached to it is an
        // unmaterialized singleton; those take the generic path since the
        // identity compare wouldn't prove the class.)
        add_comment(cb, "guard known object with singleton class");
        // TODO: the strong reference from the embedded pointer keeps the
        // object alive for as long as the code does
        jit.load_gc_ref(cb, REG1, sample_instance);
        cb.cmp(REG0, REG1);
        jit_chain_guard(Cc::NE, jit, ctx, cb, ocb, max_chain_depth, side_exit);
    } else {
        // Generic heap class: prove the value is on the heap, then
        // compare its class field
        assert!(!val_type.is_imm());

        if !val_type.is_heap() {
            add_comment(cb, "guard not immediate");
            assert!(Qfalse.as_i32() < Qnil.as_i32());
            cb.test(REG0, Opnd::imm(RUBY_IMMEDIATE_MASK as i64));
            jit_chain_guard(Cc::NE, jit, ctx, cb, ocb, max_chain_depth, side_exit);
            cb.cmp(REG0, Opnd::imm(Qnil.into()));
            jit_chain_guard(Cc::BE, jit, ctx, cb, ocb, max_chain_depth, side_exit);

            ctx.upgrade_opnd_type(slot, Type::UnknownHeap);
        }

        add_comment(cb, "guard known class");
        // TODO: the embedded class reference also pins the class
        jit.load_gc_ref(cb, REG1, known_klass);
        cb.cmp(Opnd::mem(64, REG0, RUBY_OFFSET_RBASIC_KLASS), REG1);
        jit_chain_guard(Cc::NE, jit, ctx, cb, ocb, max_chain_depth, side_exit);
    }
}

//===========================================================================
// Instance variables
//===========================================================================

/// Read an ivar off the receiver sitting in REG0, which an earlier guard
/// proved to be of the sample's class. T_OBJECT receivers with a mapped
/// slot read the slot directly, guarded on the embedded/extended layout;
/// everything else calls the host's generic lookup.
fn gen_get_ivar(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    max_chain_depth: i32,
    comptime_receiver: VALUE,
    ivar_name: ID,
    recv_slot: Slot,
    side_exit: CodePtr,
) -> CodegenStatus {
    // Guard-chain against the context as it was before this instruction
    let starting_context = *ctx;

    // Find the ivar's slot index, when the receiver is a default-layout
    // object and the name maps to a slot.
    // NOTE: this assumes the class's allocator doesn't change after
    // objects exist; nothing tracks that as an assumption yet.
    let receiver_t_object = unsafe { RB_TYPE_P(comptime_receiver, RUBY_T_OBJECT) };
    let mut ivar_index: Option<usize> = None;
    if receiver_t_object {
        unsafe {
            let iv_tbl = rb_bbjit_iv_index_tbl(comptime_receiver);
            let mut entry: *const rb_iv_index_tbl_entry = ptr::null();
            if !iv_tbl.is_null() && rb_iv_index_tbl_lookup(iv_tbl, ivar_name, &mut entry) {
                ivar_index = Some((*entry).index.as_usize());
            }
        }
    }

    let ivar_index = match ivar_index {
        Some(idx) => idx,
        None => {
            // General case: rb_ivar_get(recv, name). It can raise.
            add_comment(cb, "call rb_ivar_get()");
            jit.prepare_routine_call(ctx, cb, REG1);

            cb.mov(C_ARG_REGS[0], REG0);
            cb.mov(C_ARG_REGS[1], Opnd::uimm(ivar_name));
            cb.call_ptr(REG1, rb_ivar_get as *const u8);

            if recv_slot != SelfSlot {
                ctx.stack_pop(1);
            }
            let dst = ctx.stack_push(Type::Unknown);
            cb.mov(dst, RAX);

            // End the block so chained versions share the successor
            jump_to_next_insn(jit, ctx, cb, ocb);
            return EndBlock;
        }
    };

    // Pop the receiver unless it's self
    if recv_slot != SelfSlot {
        ctx.stack_pop(1);
    }

    let embedded = unsafe {
        FL_TEST_RAW(comptime_receiver, VALUE(ROBJECT_EMBED.as_usize())) != VALUE(0)
    };

    if embedded && ivar_index < ROBJECT_EMBED_LEN_MAX {
        // The sample stores ivars inline; guard the layout then read the
        // slot straight out of the object
        add_comment(cb, "guard embedded getivar");
        let flags = Opnd::mem(64, REG0, RUBY_OFFSET_RBASIC_FLAGS);
        cb.test(flags, Opnd::uimm(ROBJECT_EMBED as u64));
        let megamorphic_exit = counted_exit(ocb, side_exit, Counter::getivar_megamorphic);
        jit_chain_guard(
            Cc::E,
            jit,
            &starting_context,
            cb,
            ocb,
            max_chain_depth,
            megamorphic_exit,
        );

        let slot_offs = RUBY_OFFSET_ROBJECT_AS_ARY + (ivar_index * SIZEOF_VALUE) as i32;
        cb.mov(REG1, Opnd::mem(64, REG0, slot_offs));

        // Unset slots read as nil
        cb.cmp(REG1, Opnd::uimm(Qundef.into()));
        cb.mov(REG0, Opnd::uimm(Qnil.into()));
        cb.cmov(Cc::E, REG1, REG0);

        let dst = ctx.stack_push(Type::Unknown);
        cb.mov(dst, REG1);
    } else {
        // Out-of-line ivar table; guard that the object isn't embedded
        add_comment(cb, "guard extended getivar");
        let flags = Opnd::mem(64, REG0, RUBY_OFFSET_RBASIC_FLAGS);
        cb.test(flags, Opnd::uimm(ROBJECT_EMBED as u64));
        let megamorphic_exit = counted_exit(ocb, side_exit, Counter::getivar_megamorphic);
        jit_chain_guard(
            Cc::NE,
            jit,
            &starting_context,
            cb,
            ocb,
            max_chain_depth,
            megamorphic_exit,
        );

        // The table can be shorter than the index when this object never
        // had the ivar assigned
        if ivar_index >= ROBJECT_EMBED_LEN_MAX + 1 {
            let num_slots = Opnd::mem(32, REG0, RUBY_OFFSET_ROBJECT_AS_HEAP_NUMIV);
            cb.cmp(num_slots, Opnd::uimm(ivar_index as u64));
            cb.jcc_ptr(Cc::LE, counted_exit(ocb, side_exit, Counter::getivar_idx_out_of_range));
        }

        cb.mov(REG0, Opnd::mem(64, REG0, RUBY_OFFSET_ROBJECT_AS_HEAP_IVPTR));
        cb.mov(REG0, Opnd::mem(64, REG0, (ivar_index * SIZEOF_VALUE) as i32));

        // Unset slots read as nil
        cb.cmp(REG0, Opnd::uimm(Qundef.into()));
        cb.mov(REG1, Opnd::uimm(Qnil.into()));
        cb.cmov(Cc::E, REG0, REG1);

        let dst = ctx.stack_push(Type::Unknown);
        cb.mov(dst, REG0);
    }

    // End the block so chained versions share the successor
    jump_to_next_insn(jit, ctx, cb, ocb);
    EndBlock
}

fn gen_getinstancevariable(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // Specialize on the class of self, so wait for a live frame
    if !jit.at_current_insn() {
        defer_compilation(jit, ctx, cb, ocb);
        return EndBlock;
    }

    let ivar_name = jit.arg(0).as_u64();
    let comptime_self = jit.peek_self();

    let exit = side_exit(jit, ocb, ctx);

    cb.mov(REG0, Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SELF));
    jit_guard_known_klass(
        jit,
        ctx,
        cb,
        ocb,
        comptime_self.class_of(),
        SelfSlot,
        comptime_self,
        GET_IVAR_MAX_DEPTH,
        exit,
    );

    gen_get_ivar(
        jit,
        ctx,
        cb,
        ocb,
        GET_IVAR_MAX_DEPTH,
        comptime_self,
        ivar_name,
        SelfSlot,
        exit,
    )
}

fn gen_setinstancevariable(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let ivar_name = jit.arg(0);
    let ic = jit.arg(1).as_u64(); // IVC operand

    // Ivar writes can trigger allocation (table growth, wb)
    jit.prepare_routine_call(ctx, cb, REG0);

    let val = ctx.stack_pop(1);

    // rb_vm_setinstancevariable(iseq, self, name, val, ic)
    let iseq_ref = VALUE(jit.iseq as usize);
    jit.load_gc_ref(cb, C_ARG_REGS[0], iseq_ref);
    cb.mov(C_ARG_REGS[1], Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SELF));
    cb.mov(C_ARG_REGS[2], Opnd::uimm(ivar_name.into()));
    cb.mov(C_ARG_REGS[3], val);
    cb.mov(C_ARG_REGS[4], Opnd::const_ptr(ic as *const u8));
    cb.call_ptr(REG0, rb_vm_setinstancevariable as *const u8);

    KeepCompiling
}

//===========================================================================
// Fixnum arithmetic and comparisons
//===========================================================================

#[derive(Clone, Copy, PartialEq)]
enum FixnumOp {
    Add,
    Sub,
    BitAnd,
    BitOr,
}

/// The shared shape of the specialized fixnum operators: defer for a live
/// receiver, verify both operands are fixnums at compile time, register
/// the redefinition assumption, guard the operands, and emit the
/// tag-preserving operation. Falls back to a method call otherwise.
fn gen_fixnum_arith(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    bop: ruby_basic_operators,
    op: FixnumOp,
) -> CodegenStatus {
    if !jit.at_current_insn() {
        defer_compilation(jit, ctx, cb, ocb);
        return EndBlock;
    }

    let comptime_lhs = jit.peek_stack(ctx, 1);
    let comptime_rhs = jit.peek_stack(ctx, 0);

    if !(comptime_lhs.fixnum_p() && comptime_rhs.fixnum_p()) {
        // Some other class; this is really a method call
        return gen_opt_send_without_block(jit, ctx, cb, ocb);
    }

    // The exit must be requested before the operand pops below
    let exit = side_exit(jit, ocb, ctx);

    if !assume_bop_not_redefined(jit, ocb, INTEGER_REDEFINED_OP_FLAG, bop) {
        return CantCompile;
    }

    guard_two_fixnums(ctx, cb, exit);

    let rhs = ctx.stack_pop(1);
    let lhs = ctx.stack_pop(1);

    cb.mov(REG0, lhs);
    match op {
        FixnumOp::Add => {
            // (2a+1) + (2b+1) - 1 == 2(a+b) + 1
            cb.sub(REG0, Opnd::imm(1));
            cb.add(REG0, rhs);
            cb.jcc_ptr(Cc::O, exit);
        }
        FixnumOp::Sub => {
            // (2a+1) - (2b+1) + 1 == 2(a-b) + 1
            cb.sub(REG0, rhs);
            cb.jcc_ptr(Cc::O, exit);
            cb.add(REG0, Opnd::imm(1));
        }
        FixnumOp::BitAnd => {
            // Tag bit survives the and
            cb.and(REG0, rhs);
        }
        FixnumOp::BitOr => {
            // Tag bit survives the or
            cb.or(REG0, rhs);
        }
    }

    let dst = ctx.stack_push(Type::Fixnum);
    cb.mov(dst, REG0);

    KeepCompiling
}

fn gen_opt_plus(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_fixnum_arith(jit, ctx, cb, ocb, BOP_PLUS, FixnumOp::Add)
}

fn gen_opt_minus(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_fixnum_arith(jit, ctx, cb, ocb, BOP_MINUS, FixnumOp::Sub)
}

fn gen_opt_and(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_fixnum_arith(jit, ctx, cb, ocb, BOP_AND, FixnumOp::BitAnd)
}

fn gen_opt_or(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_fixnum_arith(jit, ctx, cb, ocb, BOP_OR, FixnumOp::BitOr)
}

/// Fixnum comparison specialization. Tagged fixnums order the same way
/// their values do, so the comparison works directly on the tagged form
/// and only the Qtrue/Qfalse selection differs per operator.
fn gen_fixnum_cmp(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    bop: ruby_basic_operators,
    cc: Cc,
) -> CodegenStatus {
    if !jit.at_current_insn() {
        defer_compilation(jit, ctx, cb, ocb);
        return EndBlock;
    }

    let comptime_lhs = jit.peek_stack(ctx, 1);
    let comptime_rhs = jit.peek_stack(ctx, 0);

    if !(comptime_lhs.fixnum_p() && comptime_rhs.fixnum_p()) {
        return gen_opt_send_without_block(jit, ctx, cb, ocb);
    }

    // The exit must be requested before the operand pops below
    let exit = side_exit(jit, ocb, ctx);

    if !assume_bop_not_redefined(jit, ocb, INTEGER_REDEFINED_OP_FLAG, bop) {
        return CantCompile;
    }

    guard_two_fixnums(ctx, cb, exit);

    let rhs = ctx.stack_pop(1);
    let lhs = ctx.stack_pop(1);

    // Qfalse, conditionally overwritten with Qtrue
    cb.xor(REG0_32, REG0_32);
    cb.mov(REG1, lhs);
    cb.cmp(REG1, rhs);
    cb.mov(REG1, Opnd::uimm(Qtrue.into()));
    cb.cmov(cc, REG0, REG1);

    let dst = ctx.stack_push(Type::UnknownImm);
    cb.mov(dst, REG0);

    KeepCompiling
}

fn gen_opt_lt(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_fixnum_cmp(jit, ctx, cb, ocb, BOP_LT, Cc::L)
}

fn gen_opt_le(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_fixnum_cmp(jit, ctx, cb, ocb, BOP_LE, Cc::LE)
}

fn gen_opt_ge(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_fixnum_cmp(jit, ctx, cb, ocb, BOP_GE, Cc::GE)
}

fn gen_opt_gt(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_fixnum_cmp(jit, ctx, cb, ocb, BOP_GT, Cc::G)
}

//===========================================================================
// Equality
//===========================================================================

/// Specialized equality for fixnum pairs and string pairs. Returns false
/// when no specialization applies and the caller should emit a send.
fn gen_equality_specialized(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    side_exit: CodePtr,
) -> bool {
    let comptime_lhs = jit.peek_stack(ctx, 1);
    let comptime_rhs = jit.peek_stack(ctx, 0);

    let lhs = ctx.stack_opnd(1);
    let rhs = ctx.stack_opnd(0);

    if comptime_lhs.fixnum_p() && comptime_rhs.fixnum_p() {
        if !assume_bop_not_redefined(jit, ocb, INTEGER_REDEFINED_OP_FLAG, BOP_EQ) {
            return false;
        }

        guard_two_fixnums(ctx, cb, side_exit);

        // Tagged fixnums are equal iff their bits are
        cb.mov(REG0, lhs);
        cb.cmp(REG0, rhs);
        cb.mov(REG0, Opnd::imm(Qfalse.into()));
        cb.mov(REG1, Opnd::imm(Qtrue.into()));
        cb.cmov(Cc::E, REG0, REG1);

        ctx.stack_pop(2);
        let dst = ctx.stack_push(Type::UnknownImm);
        cb.mov(dst, REG0);

        true
    } else if unsafe {
        comptime_lhs.class_of() == rb_cString && comptime_rhs.class_of() == rb_cString
    } {
        if !assume_bop_not_redefined(jit, ocb, STRING_REDEFINED_OP_FLAG, BOP_EQ) {
            return false;
        }

        // Stage the call arguments before the receiver guard clobbers REG0
        cb.mov(C_ARG_REGS[0], lhs);
        cb.mov(C_ARG_REGS[1], rhs);

        cb.mov(REG0, C_ARG_REGS[0]);
        jit_guard_known_klass(
            jit,
            ctx,
            cb,
            ocb,
            unsafe { rb_cString },
            Stack(1),
            comptime_lhs,
            SEND_MAX_DEPTH,
            side_exit,
        );

        let ret = cb.new_label("ret");

        // Identical objects are equal without looking at bytes
        cb.cmp(C_ARG_REGS[0], C_ARG_REGS[1]);
        cb.mov(RAX, Opnd::imm(Qtrue.into()));
        cb.jcc_label(Cc::E, ret);

        // The byte compare needs the argument to be a string too. Any
        // T_STRING would do, but the simple check is for ::String.
        if ctx.get_opnd_type(Stack(0)) != Type::String {
            cb.mov(REG0, C_ARG_REGS[1]);
            jit_guard_known_klass(
                jit,
                ctx,
                cb,
                ocb,
                unsafe { rb_cString },
                Stack(0),
                comptime_rhs,
                SEND_MAX_DEPTH,
                side_exit,
            );
        }

        // rb_str_eql_internal neither allocates nor raises
        cb.call_ptr(REG0, rb_str_eql_internal as *const u8);

        cb.write_label(ret);
        ctx.stack_pop(2);
        let dst = ctx.stack_push(Type::UnknownImm);
        cb.mov(dst, RAX);
        cb.link_labels();

        true
    } else {
        false
    }
}

fn gen_opt_eq(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    if !jit.at_current_insn() {
        defer_compilation(jit, ctx, cb, ocb);
        return EndBlock;
    }

    let exit = side_exit(jit, ocb, ctx);

    if gen_equality_specialized(jit, ctx, cb, ocb, exit) {
        jump_to_next_insn(jit, ctx, cb, ocb);
        EndBlock
    } else {
        gen_opt_send_without_block(jit, ctx, cb, ocb)
    }
}

fn gen_opt_neq(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // The second call data operand holds the != call site
    let cd = jit.arg(1).as_ptr();
    gen_send_general(jit, ctx, cb, ocb, cd, None)
}

//===========================================================================
// Indexing
//===========================================================================

fn gen_opt_aref(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let cd: *const rb_call_data = jit.arg(0).as_ptr();
    let argc = unsafe { vm_ci_argc(get_call_data_ci(cd)) };

    // Only single-subscript forms like a[i] are specialized
    if argc != 1 {
        gen_counter_incr(cb, Counter::oaref_argc_not_one);
        return CantCompile;
    }

    if !jit.at_current_insn() {
        defer_compilation(jit, ctx, cb, ocb);
        return EndBlock;
    }

    // Chain guards run against the entry state of this instruction
    let starting_context = *ctx;

    let comptime_recv = jit.peek_stack(ctx, 1);
    let comptime_idx = jit.peek_stack(ctx, 0);

    let exit = side_exit(jit, ocb, ctx);

    if comptime_recv.class_of() == unsafe { rb_cArray } && comptime_idx.fixnum_p() {
        if !assume_bop_not_redefined(jit, ocb, ARRAY_REDEFINED_OP_FLAG, BOP_AREF) {
            return CantCompile;
        }

        let idx_opnd = ctx.stack_pop(1);
        let recv_opnd = ctx.stack_pop(1);

        // The BOP assumption covers exactly ::Array, so the guard has to
        // prove that class and not just T_ARRAY. Heap check first.
        cb.mov(REG0, recv_opnd);
        cb.test(REG0, Opnd::uimm(RUBY_IMMEDIATE_MASK as u64));
        cb.jcc_ptr(Cc::NE, exit);
        cb.cmp(REG0, Opnd::uimm(Qfalse.into()));
        cb.jcc_ptr(Cc::E, exit);
        cb.cmp(REG0, Opnd::uimm(Qnil.into()));
        cb.jcc_ptr(Cc::E, exit);

        cb.mov(REG1, Opnd::mem(64, REG0, RUBY_OFFSET_RBASIC_KLASS));
        cb.mov(REG0, Opnd::uimm(unsafe { rb_cArray }.into()));
        cb.cmp(REG0, REG1);
        jit_chain_guard(
            Cc::NE,
            jit,
            &starting_context,
            cb,
            ocb,
            OPT_AREF_MAX_CHAIN_DEPTH,
            exit,
        );

        // And the subscript must be a fixnum
        cb.mov(REG1, idx_opnd);
        cb.test(REG1, Opnd::uimm(RUBY_FIXNUM_FLAG as u64));
        cb.jcc_ptr(Cc::E, counted_exit(ocb, exit, Counter::oaref_arg_not_fixnum));

        // rb_ary_entry_internal(ary, untagged_idx); leaf, so no PC sync
        cb.mov(RDI, recv_opnd);
        cb.sar(REG1, Opnd::uimm(1));
        cb.mov(RSI, REG1);
        cb.call_ptr(REG0, rb_ary_entry_internal as *const u8);

        let dst = ctx.stack_push(Type::Unknown);
        cb.mov(dst, RAX);

        // Chained versions share the successor
        jump_to_next_insn(jit, ctx, cb, ocb);
        EndBlock
    } else if comptime_recv.class_of() == unsafe { rb_cHash } {
        if !assume_bop_not_redefined(jit, ocb, HASH_REDEFINED_OP_FLAG, BOP_AREF) {
            return CantCompile;
        }

        let key_opnd = ctx.stack_opnd(0);
        let recv_opnd = ctx.stack_opnd(1);

        cb.mov(REG0, recv_opnd);
        jit_guard_known_klass(
            jit,
            ctx,
            cb,
            ocb,
            unsafe { rb_cHash },
            Stack(1),
            comptime_recv,
            OPT_AREF_MAX_CHAIN_DEPTH,
            exit,
        );

        // Stage arguments, then sync: rb_hash_aref can call user #hash
        cb.mov(C_ARG_REGS[0], REG0);
        cb.mov(C_ARG_REGS[1], key_opnd);
        jit.prepare_routine_call(ctx, cb, REG0);

        cb.call_ptr(REG0, rb_hash_aref as *const u8);

        ctx.stack_pop(2);
        let dst = ctx.stack_push(Type::Unknown);
        cb.mov(dst, RAX);

        jump_to_next_insn(jit, ctx, cb, ocb);
        EndBlock
    } else {
        // Some other receiver; this is a plain #[] send
        gen_opt_send_without_block(jit, ctx, cb, ocb)
    }
}

fn gen_opt_aset(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    if !jit.at_current_insn() {
        defer_compilation(jit, ctx, cb, ocb);
        return EndBlock;
    }

    let comptime_recv = jit.peek_stack(ctx, 2);
    let comptime_key = jit.peek_stack(ctx, 1);

    let recv = ctx.stack_opnd(2);
    let key = ctx.stack_opnd(1);
    let val = ctx.stack_opnd(0);

    if comptime_recv.class_of() == unsafe { rb_cArray } && comptime_key.fixnum_p() {
        let exit = side_exit(jit, ocb, ctx);

        cb.mov(REG0, recv);
        jit_guard_known_klass(
            jit,
            ctx,
            cb,
            ocb,
            unsafe { rb_cArray },
            Stack(2),
            comptime_recv,
            SEND_MAX_DEPTH,
            exit,
        );

        cb.mov(REG0, key);
        jit_guard_known_klass(
            jit,
            ctx,
            cb,
            ocb,
            unsafe { rb_cInteger },
            Stack(1),
            comptime_key,
            SEND_MAX_DEPTH,
            exit,
        );

        // rb_ary_store(ary, idx, val) with the subscript untagged
        cb.mov(C_ARG_REGS[0], recv);
        cb.mov(C_ARG_REGS[1], key);
        cb.sar(C_ARG_REGS[1], Opnd::uimm(1));
        cb.mov(C_ARG_REGS[2], val);

        // The array may grow, and frozen receivers raise
        jit.prepare_routine_call(ctx, cb, REG0);

        cb.call_ptr(REG0, rb_ary_store as *const u8);

        // The statement's value is the stored value, still on the stack
        cb.mov(REG0, ctx.stack_opnd(0));
        ctx.stack_pop(3);
        let dst = ctx.stack_push(Type::Unknown);
        cb.mov(dst, REG0);

        jump_to_next_insn(jit, ctx, cb, ocb);
        EndBlock
    } else if comptime_recv.class_of() == unsafe { rb_cHash } {
        let exit = side_exit(jit, ocb, ctx);

        cb.mov(REG0, recv);
        jit_guard_known_klass(
            jit,
            ctx,
            cb,
            ocb,
            unsafe { rb_cHash },
            Stack(2),
            comptime_recv,
            SEND_MAX_DEPTH,
            exit,
        );

        cb.mov(C_ARG_REGS[0], recv);
        cb.mov(C_ARG_REGS[1], key);
        cb.mov(C_ARG_REGS[2], val);

        // May rehash, and the key's #hash can run user code
        jit.prepare_routine_call(ctx, cb, REG0);

        cb.call_ptr(REG0, rb_hash_aset as *const u8);

        ctx.stack_pop(3);
        let dst = ctx.stack_push(Type::Unknown);
        cb.mov(dst, RAX);

        jump_to_next_insn(jit, ctx, cb, ocb);
        EndBlock
    } else {
        gen_opt_send_without_block(jit, ctx, cb, ocb)
    }
}

//===========================================================================
// Remaining opt_* instructions
//===========================================================================

fn gen_opt_mod(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // The helper may create bignums
    jit.prepare_routine_call(ctx, cb, REG0);

    let exit = side_exit(jit, ocb, ctx);

    let rhs = ctx.stack_pop(1);
    let lhs = ctx.stack_pop(1);

    // rb_vm_opt_mod handles the fast paths and reports Qundef when the
    // operator is redefined or the operands are exotic
    cb.mov(C_ARG_REGS[0], lhs);
    cb.mov(C_ARG_REGS[1], rhs);
    cb.call_ptr(REG0, rb_vm_opt_mod as *const u8);

    cb.cmp(RAX, Opnd::imm(Qundef.as_i64()));
    cb.jcc_ptr(Cc::E, exit);

    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_opt_str_freeze(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    if !assume_bop_not_redefined(jit, ocb, STRING_REDEFINED_OP_FLAG, BOP_FREEZE) {
        return CantCompile;
    }

    // With #freeze untouched the frozen literal itself is the result
    let frozen_str = jit.arg(0);
    jit.load_gc_ref(cb, REG0, frozen_str);

    let dst = ctx.stack_push(Type::String);
    cb.mov(dst, REG0);

    KeepCompiling
}

fn gen_opt_str_uminus(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    if !assume_bop_not_redefined(jit, ocb, STRING_REDEFINED_OP_FLAG, BOP_UMINUS) {
        return CantCompile;
    }

    // Same shape as opt_str_freeze: push the interned literal
    let frozen_str = jit.arg(0);
    jit.load_gc_ref(cb, REG0, frozen_str);

    let dst = ctx.stack_push(Type::String);
    cb.mov(dst, REG0);

    KeepCompiling
}

fn gen_opt_case_dispatch(
    _jit: &mut JITState,
    ctx: &mut Context,
    _cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // This instruction is an optimization over a chain of comparisons;
    // taking its fallthrough (no dispatch) leg is always correct, and the
    // comparison chain that follows gets compiled normally. Worth
    // revisiting for big dispatch tables.
    ctx.stack_pop(1);
    KeepCompiling
}

// The opt_* forms with no specialization here degrade to plain sends
macro_rules! defer_to_send {
    ($($fname:ident,)+) => {
        $(
            fn $fname(
                jit: &mut JITState,
                ctx: &mut Context,
                cb: &mut CodeBlock,
                ocb: &mut OutlinedCb,
            ) -> CodegenStatus {
                gen_opt_send_without_block(jit, ctx, cb, ocb)
            }
        )+
    }
}

defer_to_send! {
    gen_opt_mult,
    gen_opt_div,
    gen_opt_ltlt,
    gen_opt_nil_p,
    gen_opt_empty_p,
    gen_opt_succ,
    gen_opt_not,
    gen_opt_size,
    gen_opt_length,
    gen_opt_regexpmatch2,
}

//===========================================================================
// Checks and queries
//===========================================================================

fn gen_defined(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let op_type = jit.arg(0);
    let obj = jit.arg(1);
    let pushval = jit.arg(2);

    // Querying definedness can call methods (eg: respond_to_missing?)
    jit.prepare_routine_call(ctx, cb, REG0);

    let subject = ctx.stack_pop(1);

    // rb_vm_defined(ec, cfp, op_type, obj, v) -> bool
    cb.mov(C_ARG_REGS[0], REG_EC);
    cb.mov(C_ARG_REGS[1], REG_CFP);
    cb.mov(C_ARG_REGS[2], Opnd::uimm(op_type.into()));
    jit.load_gc_ref(cb, C_ARG_REGS[3], obj);
    cb.mov(C_ARG_REGS[4], subject);
    cb.call_ptr(REG0, rb_vm_defined as *const u8);

    // Select pushval or nil from the boolean (low byte) result
    jit.load_gc_ref(cb, REG1, pushval);
    cb.cmp(AL, Opnd::imm(0));
    cb.mov(RAX, Opnd::uimm(Qnil.into()));
    cb.cmov(Cc::NE, RAX, REG1);

    let out_type = if pushval.special_const_p() {
        Type::UnknownImm
    } else {
        Type::Unknown
    };
    let dst = ctx.stack_push(out_type);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_checktype(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let type_val = jit.arg(0).as_u32();

    // The compiler only emits these three type queries
    if !matches!(type_val, RUBY_T_STRING | RUBY_T_ARRAY | RUBY_T_HASH) {
        return CantCompile;
    }

    let val_type = ctx.get_opnd_type(Stack(0));
    let val = ctx.stack_pop(1);

    // Answered at compile time when the type is known
    if let Some(known) = match (val_type, type_val) {
        (Type::String, RUBY_T_STRING) => Some(true),
        (Type::Array, RUBY_T_ARRAY) => Some(true),
        (Type::Hash, RUBY_T_HASH) => Some(true),
        _ if val_type.is_imm() || val_type.is_specific() => Some(false),
        _ => None,
    } {
        let (result, ty) = if known { (Qtrue, Type::True) } else { (Qfalse, Type::False) };
        let dst = ctx.stack_push(ty);
        cb.mov(dst, Opnd::uimm(result.as_u64()));
        return KeepCompiling;
    }

    cb.mov(REG0, val);
    cb.mov(REG1, Opnd::uimm(Qfalse.as_u64()));

    let done = cb.new_label("done");

    // Immediates answer false without a flags load
    if !val_type.is_heap() {
        cb.test(REG0, Opnd::uimm(RUBY_IMMEDIATE_MASK as u64));
        cb.jcc_label(Cc::NE, done);
        cb.cmp(REG0, Opnd::uimm(Qnil.as_u64()));
        cb.jcc_label(Cc::BE, done);
    }

    // Compare the type bits out of the object header
    cb.mov(REG0, Opnd::mem(64, REG0, RUBY_OFFSET_RBASIC_FLAGS));
    cb.and(REG0, Opnd::uimm(RUBY_T_MASK as u64));
    cb.cmp(REG0, Opnd::uimm(type_val as u64));
    cb.mov(REG0, Opnd::uimm(Qtrue.as_u64()));
    cb.cmov(Cc::E, REG1, REG0);

    cb.write_label(done);
    let dst = ctx.stack_push(Type::UnknownImm);
    cb.mov(dst, REG1);
    cb.link_labels();

    KeepCompiling
}

fn gen_checkkeyword(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // The unspecified-keywords bitmap lives in a fixnum local; methods
    // with enough keywords to overflow it use a hash instead
    if unsafe { !get_iseq_flags_has_kw(jit.iseq) } {
        return CantCompile;
    }

    // EP offset of the bitmap local, and which keyword to test
    let bits_offset = jit.arg(0).as_i32();
    let index: i64 = jit.arg(1).as_i64();
    if index >= 32 {
        return CantCompile;
    }

    gen_get_ep(cb, REG0, 0);
    let bits_opnd = Opnd::mem(64, REG0, -SIZEOF_VALUE_I32 * bits_offset);

    // Shifting the tested bit up one skips untagging the fixnum
    cb.test(bits_opnd, Opnd::imm(1 << (index + 1)));
    cb.mov(REG0, Opnd::uimm(Qfalse.into()));
    cb.mov(REG1, Opnd::uimm(Qtrue.into()));
    cb.cmov(Cc::E, REG0, REG1);

    let dst = ctx.stack_push(Type::UnknownImm);
    cb.mov(dst, REG0);

    KeepCompiling
}

// Unpack an array into n stack slots, padding with nils
fn gen_expandarray(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let num = jit.arg(0).as_i32();
    let flags = jit.arg(1).as_usize();

    // Splat and post-arg modes shuffle values around; not handled
    if flags & 0x01 != 0 {
        incr_counter(Counter::expandarray_splat);
        return CantCompile;
    }
    if flags & 0x02 != 0 {
        incr_counter(Counter::expandarray_postarg);
        return CantCompile;
    }

    let exit = side_exit(jit, ocb, ctx);

    let array_type = ctx.get_opnd_type(Stack(0));
    let array_opnd = ctx.stack_pop(1);

    // `a, b = nil` assigns all nils
    if array_type == Type::Nil {
        for _ in 0..num {
            let dst = ctx.stack_push(Type::Nil);
            cb.mov(dst, Opnd::uimm(Qnil.into()));
        }
        return KeepCompiling;
    }

    // Only arrays are handled beyond that
    cb.mov(REG0, array_opnd);
    guard_object_is_heap(cb, REG0, counted_exit(ocb, exit, Counter::expandarray_not_array));
    guard_object_is_array(cb, REG0, REG1, counted_exit(ocb, exit, Counter::expandarray_not_array));

    if num == 0 {
        return KeepCompiling;
    }

    // Pick the length from the embedded header or the heap header
    let flags_opnd = Opnd::mem(64, REG0, RUBY_OFFSET_RBASIC_FLAGS);
    cb.mov(REG1, flags_opnd);
    cb.and(REG1, Opnd::uimm(RARRAY_EMBED_LEN_MASK as u64));
    cb.shr(REG1, Opnd::uimm(RARRAY_EMBED_LEN_SHIFT as u64));

    cb.test(flags_opnd, Opnd::uimm(RARRAY_EMBED_FLAG as u64));
    cb.cmov(Cc::E, REG1, Opnd::mem(64, REG0, RUBY_OFFSET_RARRAY_AS_HEAP_LEN));

    // Padding short arrays with nils is left to the interpreter
    cb.cmp(REG1, Opnd::uimm(num as u64));
    cb.jcc_ptr(Cc::L, counted_exit(ocb, exit, Counter::expandarray_rhs_too_small));

    // Element pointer: embedded elements or out-of-line buffer
    cb.lea(REG1, Opnd::mem(64, REG0, RUBY_OFFSET_RARRAY_AS_ARY));
    cb.test(flags_opnd, Opnd::uimm(RARRAY_EMBED_FLAG as u64));
    cb.cmov(Cc::E, REG1, Opnd::mem(64, REG0, RUBY_OFFSET_RARRAY_AS_HEAP_PTR));

    // Rightmost target gets the lowest index
    for i in (0..num).rev() {
        let dst = ctx.stack_push(Type::Unknown);
        cb.mov(REG0, Opnd::mem(64, REG1, i * SIZEOF_VALUE_I32));
        cb.mov(dst, REG0);
    }

    KeepCompiling
}

//===========================================================================
// Control flow
//===========================================================================

/// Flags tests the conditional branch instructions dispatch on
#[derive(Clone, Copy)]
enum BranchTest {
    /// Truthy: any bit outside the Qnil pattern.
    ///   Qfalse  ...0000 0000
    ///   Qnil    ...0000 1000
    Truthy,
    /// Exactly the nil pattern
    IsNil,
}

/// The three conditional branch instructions share everything except the
/// flags test and the branch polarity. Backward branches close loops, so
/// they check for pending interrupts first (before the value test, which
/// the interrupt check would clobber).
fn gen_two_way_branch(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    test: BranchTest,
    gen_fn: BranchGenFn,
) -> CodegenStatus {
    let jump_offset = jit.arg(0).as_i32();

    if jump_offset < 0 {
        let exit = side_exit(jit, ocb, ctx);
        gen_check_ints(cb, exit);
    }

    let val = ctx.stack_pop(1);
    match test {
        BranchTest::Truthy => cb.test(val, Opnd::imm(!Qnil.as_i64())),
        BranchTest::IsNil => cb.cmp(val, Opnd::uimm(Qnil.into())),
    }

    let next_idx = jit.next_insn_idx() as i32;
    let jump_block = BlockId {
        iseq: jit.iseq,
        idx: (next_idx + jump_offset) as u32,
    };
    let next_block = BlockId {
        iseq: jit.iseq,
        idx: next_idx as u32,
    };

    gen_branch(
        jit,
        cb,
        ocb,
        jump_block,
        ctx,
        Some(next_block),
        Some(ctx),
        gen_fn,
    );

    EndBlock
}

fn gen_branchif(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_two_way_branch(jit, ctx, cb, ocb, BranchTest::Truthy, BranchGenFn::JumpIfNotZero)
}

fn gen_branchunless(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_two_way_branch(jit, ctx, cb, ocb, BranchTest::Truthy, BranchGenFn::JumpIfZero)
}

fn gen_branchnil(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    gen_two_way_branch(jit, ctx, cb, ocb, BranchTest::IsNil, BranchGenFn::JumpIfZero)
}

fn gen_jump(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let jump_offset = jit.arg(0).as_i32();

    if jump_offset < 0 {
        let exit = side_exit(jit, ocb, ctx);
        gen_check_ints(cb, exit);
    }

    let jump_block = BlockId {
        iseq: jit.iseq,
        idx: (jit.next_insn_idx() as i32 + jump_offset) as u32,
    };

    gen_direct_jump(jit, ctx, jump_block, cb);

    EndBlock
}

//===========================================================================
// Specialized C method codegen
//===========================================================================

/// Generate inline code standing in for a particular C method, instead of
/// a full frame push and call. Returns false when the specialization
/// doesn't apply and the ordinary cfunc path should run. The caller has
/// already guarded the receiver's class and arity.
///
/// Code generated here runs with no control frame of its own and no
/// interrupt check, so only simple, non-allocating, non-calling paths are
/// eligible.
type MethodGenFn = fn(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    ci: *const rb_callinfo,
    cme: *const rb_callable_method_entry_t,
    block: Option<IseqPtr>,
    argc: i32,
    known_recv_class: *const VALUE,
) -> bool;

// BasicObject#!
fn jit_rb_obj_not(
    _jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
    _ci: *const rb_callinfo,
    _cme: *const rb_callable_method_entry_t,
    _block: Option<IseqPtr>,
    _argc: i32,
    _known_recv_class: *const VALUE,
) -> bool {
    let recv_type = ctx.get_opnd_type(Stack(0));

    // The class guard that ran before us typically pins the type, making
    // the answer a compile-time constant
    let result = if recv_type == Type::Nil || recv_type == Type::False {
        Qtrue
    } else if recv_type.is_heap() || recv_type.is_specific() {
        Qfalse
    } else {
        return false;
    };

    add_comment(cb, "BasicObject#!");
    ctx.stack_pop(1);
    let dst = ctx.stack_push(Type::from(result));
    cb.mov(dst, Opnd::uimm(result.into()));

    true
}

// NilClass#nil?
fn jit_rb_true(
    _jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
    _ci: *const rb_callinfo,
    _cme: *const rb_callable_method_entry_t,
    _block: Option<IseqPtr>,
    _argc: i32,
    _known_recv_class: *const VALUE,
) -> bool {
    add_comment(cb, "nil? == true");
    ctx.stack_pop(1);
    let dst = ctx.stack_push(Type::True);
    cb.mov(dst, Opnd::uimm(Qtrue.into()));
    true
}

// Kernel#nil? on a non-nil receiver
fn jit_rb_false(
    _jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
    _ci: *const rb_callinfo,
    _cme: *const rb_callable_method_entry_t,
    _block: Option<IseqPtr>,
    _argc: i32,
    _known_recv_class: *const VALUE,
) -> bool {
    add_comment(cb, "nil? == false");
    ctx.stack_pop(1);
    let dst = ctx.stack_push(Type::False);
    cb.mov(dst, Opnd::uimm(Qfalse.into()));
    true
}

// Identity comparison: BasicObject#==/equal?, Kernel#eql?, Module#==,
// Symbol#==/===
fn jit_rb_obj_equal(
    _jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
    _ci: *const rb_callinfo,
    _cme: *const rb_callable_method_entry_t,
    _block: Option<IseqPtr>,
    _argc: i32,
    _known_recv_class: *const VALUE,
) -> bool {
    add_comment(cb, "equal?");

    let arg = ctx.stack_pop(1);
    let recv = ctx.stack_pop(1);

    cb.mov(REG0, recv);
    cb.cmp(REG0, arg);
    cb.mov(REG0, Opnd::uimm(Qtrue.into()));
    cb.mov(REG1, Opnd::uimm(Qfalse.into()));
    cb.cmov(Cc::NE, REG0, REG1);

    let dst = ctx.stack_push(Type::UnknownImm);
    cb.mov(dst, REG0);
    true
}

// String#+@: dup when frozen, identity otherwise
fn jit_rb_str_uplus(
    _jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
    _ci: *const rb_callinfo,
    _cme: *const rb_callable_method_entry_t,
    _block: Option<IseqPtr>,
    _argc: i32,
    _known_recv_class: *const VALUE,
) -> bool {
    add_comment(cb, "String#+@");

    let recv = ctx.stack_pop(1);
    cb.mov(REG0, recv);
    cb.mov(REG1, Opnd::mem(64, REG0, RUBY_OFFSET_RBASIC_FLAGS));
    cb.test(REG1, Opnd::imm(RUBY_FL_FREEZE as i64));

    let push_it = cb.new_label("push_it");
    cb.jcc_label(Cc::E, push_it);

    // Frozen; the result is a fresh mutable copy
    cb.mov(C_ARG_REGS[0], REG0);
    cb.call_ptr(REG0, rb_str_dup as *const u8);

    cb.write_label(push_it);
    let dst = ctx.stack_push(Type::String);
    cb.mov(dst, REG0);

    cb.link_labels();
    true
}

// String#bytesize
fn jit_rb_str_bytesize(
    _jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
    _ci: *const rb_callinfo,
    _cme: *const rb_callable_method_entry_t,
    _block: Option<IseqPtr>,
    _argc: i32,
    _known_recv_class: *const VALUE,
) -> bool {
    add_comment(cb, "String#bytesize");

    let recv = ctx.stack_pop(1);
    cb.mov(C_ARG_REGS[0], recv);
    cb.call_ptr(REG0, rb_str_bytesize as *const u8);

    let dst = ctx.stack_push(Type::Fixnum);
    cb.mov(dst, RAX);

    true
}

// String#to_s/to_str on a plain String returns the receiver, making the
// whole call a no-op once the class is guarded
fn jit_rb_str_to_s(
    _jit: &mut JITState,
    _ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
    _ci: *const rb_callinfo,
    _cme: *const rb_callable_method_entry_t,
    _block: Option<IseqPtr>,
    _argc: i32,
    known_recv_class: *const VALUE,
) -> bool {
    if !known_recv_class.is_null() && unsafe { *known_recv_class == rb_cString } {
        add_comment(cb, "to_s on plain string");
        // Receiver in, receiver out
        return true;
    }
    false
}

// String#<< with a string argument, the workhorse of template rendering
fn jit_rb_str_concat(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    _ci: *const rb_callinfo,
    _cme: *const rb_callable_method_entry_t,
    _block: Option<IseqPtr>,
    _argc: i32,
    _known_recv_class: *const VALUE,
) -> bool {
    // The integer-codepoint form of << isn't handled, and a non-string
    // argument would need a #to_str call, which needs a synced PC we
    // don't have here
    if ctx.get_opnd_type(Stack(0)) != Type::String {
        return false;
    }

    let comptime_arg = jit.peek_stack(ctx, 0);
    let exit = side_exit(jit, ocb, ctx);

    // Prove the argument really is a String at run time
    cb.mov(REG0, ctx.stack_opnd(0));
    jit_guard_known_klass(
        jit,
        ctx,
        cb,
        ocb,
        unsafe { rb_cString },
        Stack(0),
        comptime_arg,
        SEND_MAX_DEPTH,
        exit,
    );

    let arg = ctx.stack_pop(1);
    let recv = ctx.stack_pop(1);

    add_comment(cb, "String#<<");

    // Both append entry points take (recv, arg)
    cb.mov(C_ARG_REGS[0], recv);
    cb.mov(C_ARG_REGS[1], arg);

    // A mismatch in any encoding header bit forces the slow,
    // encoding-aware append
    cb.mov(REG0, recv);
    cb.mov(REG1, arg);
    cb.mov(REG0, Opnd::mem(64, REG0, RUBY_OFFSET_RBASIC_FLAGS));
    cb.xor(REG0, Opnd::mem(64, REG1, RUBY_OFFSET_RBASIC_FLAGS));
    cb.test(REG0, Opnd::uimm(RUBY_ENCODING_MASK));

    let enc_mismatch = cb.new_label("enc_mismatch");
    cb.jcc_label(Cc::NE, enc_mismatch);

    // Same encoding: plain byte append
    cb.call_ptr(REG0, rb_bbjit_str_simple_append as *const u8);
    let push_ret = cb.new_label("push_ret");
    cb.jmp_label(push_ret);

    cb.write_label(enc_mismatch);
    cb.call_ptr(REG0, rb_str_append as *const u8);

    cb.write_label(push_ret);
    let dst = ctx.stack_push(Type::String);
    cb.mov(dst, RAX);

    cb.link_labels();
    true
}

// Thread.current: two loads off the execution context
fn jit_thread_s_current(
    _jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
    _ci: *const rb_callinfo,
    _cme: *const rb_callable_method_entry_t,
    _block: Option<IseqPtr>,
    _argc: i32,
    _known_recv_class: *const VALUE,
) -> bool {
    add_comment(cb, "Thread.current");
    ctx.stack_pop(1);

    // ec->thread_ptr->self
    cb.mov(REG0, Opnd::mem(64, REG_EC, RUBY_OFFSET_EC_THREAD_PTR));
    cb.mov(REG0, Opnd::mem(64, REG0, RUBY_OFFSET_THREAD_SELF));

    let dst = ctx.stack_push(Type::UnknownHeap);
    cb.mov(dst, REG0);
    true
}

//===========================================================================
// Method dispatch
//===========================================================================

/// Is a c_call/c_return tracepoint active anywhere right now?
fn c_method_tracing_currently_enabled(jit: &JITState) -> bool {
    unsafe { rb_bbjit_c_method_tracing_enabled(jit.ec.unwrap()) }
}

/// Call a C-implemented method: build its CFUNC control frame, marshal
/// the Ruby arguments into C argument registers, call, and tear the frame
/// back down. The return address gets a patch point so c_return tracing
/// can take over later.
fn gen_send_cfunc(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    ci: *const rb_callinfo,
    cme: *const rb_callable_method_entry_t,
    block: Option<IseqPtr>,
    argc: i32,
    recv_known_klass: *const VALUE,
) -> CodegenStatus {
    let cfunc = unsafe { get_cme_def_body_cfunc(cme) };
    let cfunc_argc = unsafe { get_mct_argc(cfunc) };

    // Arity -1 takes (argc, argv, recv); other negative forms take a Ruby
    // array and aren't compiled
    if cfunc_argc < -1 {
        gen_counter_incr(cb, Counter::send_cfunc_ruby_array_varg);
        return CantCompile;
    }
    if cfunc_argc >= 0 && cfunc_argc != argc {
        gen_counter_incr(cb, Counter::send_cfunc_argc_mismatch);
        return CantCompile;
    }
    // recv plus args must fit in the register convention
    if cfunc_argc >= 0 && argc + 1 > C_ARG_REGS.len() as i32 {
        gen_counter_incr(cb, Counter::send_cfunc_toomany_args);
        return CantCompile;
    }

    // Tracing wants c_call/c_return events this code would never fire
    if c_method_tracing_currently_enabled(jit) {
        gen_counter_incr(cb, Counter::send_cfunc_tracing);
        return CantCompile;
    }

    // Prefer a registered specialization over the general call
    if let Some(specialized) = lookup_cfunc_codegen(unsafe { (*cme).def }) {
        let emitted_from = cb.get_write_pos();
        if specialized(jit, ctx, cb, ocb, ci, cme, block, argc, recv_known_klass) {
            // The invalidation patch needs room even over tiny bodies
            let emitted = cb.get_write_pos() - emitted_from;
            if emitted < JUMP_SIZE_IN_BYTES {
                add_comment(cb, "pad for invalidation patch");
                cb.nop((JUMP_SIZE_IN_BYTES - emitted) as u32);
            }
            // One call per block; end it so invalidation stays per-call
            jump_to_next_insn(jit, ctx, cb, ocb);
            return EndBlock;
        }
    }

    let exit = side_exit(jit, ocb, ctx);

    gen_check_ints(cb, exit);

    // The callee frame plus a safety margin must fit the VM stack
    add_comment(cb, "stack overflow check");
    cb.lea(
        REG0,
        ctx.sp_opnd((SIZEOF_VALUE * 4 + 2 * RUBY_SIZEOF_CONTROL_FRAME) as isize),
    );
    cb.cmp(REG_CFP, REG0);
    cb.jcc_ptr(Cc::LE, counted_exit(ocb, exit, Counter::send_se_cf_overflow));

    // Receiver sits under the arguments
    let recv = ctx.stack_opnd(argc);

    // The callee may raise; it must see the next PC
    jit.save_next_pc(cb, REG0);

    if let Some(block_iseq) = block {
        // A literal block comes along as cfp->block_code; the captured
        // block aliases &cfp->self. See vm_caller_setup_arg_block.
        jit.load_gc_ref(cb, REG0, VALUE(block_iseq as usize));
        cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_BLOCK_CODE), REG0);
    }

    // The callee's SP starts past three environment words
    cb.lea(REG0, ctx.sp_opnd((SIZEOF_VALUE as isize) * 3));

    // sp[-3]: the method entry, trusted because cme invalidation would
    // have thrown this block away first
    jit.load_gc_ref(cb, REG1, VALUE(cme as usize));
    cb.mov(Opnd::mem(64, REG0, 8 * -3), REG1);

    // sp[-2]: block handler (tagged captured block, or none)
    if block.is_some() {
        cb.lea(REG1, Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SELF));
        cb.or(REG1, Opnd::imm(1));
        cb.mov(Opnd::mem(64, REG0, 8 * -2), REG1);
    } else {
        cb.mov(Opnd::mem(64, REG0, 8 * -2), Opnd::uimm(VM_BLOCK_HANDLER_NONE.into()));
    }

    // sp[-1]: frame type bits
    let frame_type = VM_FRAME_MAGIC_CFUNC | VM_FRAME_FLAG_CFRAME | VM_ENV_FLAG_LOCAL;
    cb.mov(Opnd::mem(64, REG0, 8 * -1), Opnd::uimm(frame_type.into()));

    // Claim a fresh control frame (they grow down)
    add_comment(cb, "push callee CFP");
    cb.sub(
        Opnd::mem(64, REG_EC, RUBY_OFFSET_EC_CFP),
        Opnd::uimm(RUBY_SIZEOF_CONTROL_FRAME as u64),
    );

    // Populate it: sp/bp past the env words, ep just below sp, pc and
    // iseq empty for a C frame
    cb.mov(REG1, Opnd::mem(64, REG_EC, RUBY_OFFSET_EC_CFP));
    cb.mov(Opnd::mem(64, REG1, RUBY_OFFSET_CFP_PC), Opnd::imm(0));
    cb.mov(Opnd::mem(64, REG1, RUBY_OFFSET_CFP_SP), REG0);
    cb.mov(Opnd::mem(64, REG1, RUBY_OFFSET_CFP_ISEQ), Opnd::imm(0));
    cb.mov(Opnd::mem(64, REG1, RUBY_OFFSET_CFP_BLOCK_CODE), Opnd::imm(0));
    cb.mov(Opnd::mem(64, REG1, RUBY_OFFSET_CFP_BP), REG0);
    cb.sub(REG0, Opnd::uimm(SIZEOF_VALUE as u64));
    cb.mov(Opnd::mem(64, REG1, RUBY_OFFSET_CFP_EP), REG0);
    cb.mov(REG0, recv);
    cb.mov(Opnd::mem(64, REG1, RUBY_OFFSET_CFP_SELF), REG0);

    // The stack operands die with the call; take their address first
    cb.lea(RAX, ctx.sp_opnd(0));
    ctx.stack_pop((argc + 1) as usize);

    // Flush SP so the callee (or GC within it) sees a rooted stack
    gen_save_sp(cb, ctx);

    if cfunc_argc >= 0 {
        // Fixed arity: recv then args, straight into argument registers
        for i in 0..=argc as usize {
            let from_top = argc + 1 - i as i32;
            cb.mov(C_ARG_REGS[i], Opnd::mem(64, RAX, -from_top * SIZEOF_VALUE_I32));
        }
    } else {
        // Variadic: f(argc, argv, recv)
        cb.mov(C_ARG_REGS[0], Opnd::imm(argc.into()));
        cb.lea(C_ARG_REGS[1], Opnd::mem(64, RAX, -argc * SIZEOF_VALUE_I32));
        cb.mov(C_ARG_REGS[2], Opnd::mem(64, RAX, -(argc + 1) * SIZEOF_VALUE_I32));
    }

    add_comment(cb, "call C function");
    cb.call_ptr(REG0, unsafe { get_mct_func(cfunc) });

    // The return address doubles as the c_return patch point: tracing
    // rewrites it into a jump to the full_cfunc_return sequence
    record_global_inval_patch(cb, CodegenGlobals::get_outline_full_cfunc_return_pos());

    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, RAX);

    // Release the callee frame
    cb.add(
        Opnd::mem(64, REG_EC, RUBY_OFFSET_EC_CFP),
        Opnd::uimm(RUBY_SIZEOF_CONTROL_FRAME as u64),
    );

    // The callee had our frame; locals may have changed under us
    ctx.clear_local_types();

    // End the block after each call. The successor has sp_offset == 1
    // either way, so iseq and cfunc calls share their continuations.
    jump_to_next_insn(jit, ctx, cb, ocb);
    EndBlock
}

/// Call a bytecode method: build its frame, seed its locals, wire the
/// return with a branch that writes cfp->jit_return, and jump straight
/// into its (lazily compiled) body.
fn gen_send_iseq(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    ci: *const rb_callinfo,
    cme: *const rb_callable_method_entry_t,
    block: Option<IseqPtr>,
    argc: i32,
) -> CodegenStatus {
    let iseq = unsafe { get_def_iseq_ptr((*cme).def) };

    if unsafe { vm_ci_flag(ci) } & VM_CALL_TAILCALL != 0 {
        gen_counter_incr(cb, Counter::send_iseq_tailcall);
        return CantCompile;
    }

    // Only lead and optional parameters are handled without the
    // interpreter's argument shuffling (and its allocations)
    if unsafe {
        get_iseq_flags_has_rest(iseq)
            || get_iseq_flags_has_post(iseq)
            || get_iseq_flags_has_kw(iseq)
            || get_iseq_flags_has_kwrest(iseq)
            || get_iseq_flags_accepts_no_kwarg(iseq)
    } {
        gen_counter_incr(cb, Counter::send_iseq_complex_callee);
        return CantCompile;
    }

    let mut num_params = unsafe { get_iseq_body_param_size(iseq) };

    // A block parameter costs nothing when the callee owns its frame; a
    // block local in an outer frame would need materialization
    if unsafe { get_iseq_flags_has_block(iseq) } {
        if unsafe { get_iseq_body_local_iseq(iseq) == iseq } {
            num_params -= 1;
        } else {
            gen_counter_incr(cb, Counter::send_iseq_complex_callee);
            return CantCompile;
        }
    }

    // Arity check, and for optionals: pick the entry PC for this argc
    let lead_num = unsafe { get_iseq_body_param_lead_num(iseq) };
    let opt_num = unsafe { get_iseq_body_param_opt_num(iseq) };
    let opts_filled = argc - lead_num;

    if opts_filled < 0 || opts_filled > opt_num {
        gen_counter_incr(cb, Counter::send_iseq_arity_error);
        return CantCompile;
    }

    let mut start_pc_offset = 0;
    if opt_num > 0 {
        num_params -= (opt_num - opts_filled) as u32;
        unsafe {
            let opt_table = get_iseq_body_param_opt_table(iseq);
            start_pc_offset = (*opt_table.offset(opts_filled as isize)).as_u32();
        }
    }

    // Locals that aren't parameters get initialized to nil below
    let num_locals = unsafe { get_iseq_body_local_table_size(iseq) as i32 } - num_params as i32;

    let exit = side_exit(jit, ocb, ctx);

    gen_check_ints(cb, exit);

    // A leaf builtin body can skip the frame entirely and become one call
    let leaf_builtin = unsafe { rb_leaf_builtin_function(iseq) };
    if !leaf_builtin.is_null() && block.is_none() {
        let builtin_argc = unsafe { (*leaf_builtin).argc };
        // ec, recv, and the arguments must all fit in registers
        if builtin_argc + 2 <= C_ARG_REGS.len() as i32 {
            add_comment(cb, "inlined leaf builtin");

            cb.mov(C_ARG_REGS[0], REG_EC);
            for i in 0..=builtin_argc {
                cb.mov(C_ARG_REGS[(i + 1) as usize], ctx.stack_opnd(builtin_argc - i));
            }
            ctx.stack_pop((builtin_argc + 1) as usize);
            cb.call_ptr(REG0, unsafe { (*leaf_builtin).func_ptr } as *const u8);

            let dst = ctx.stack_push(Type::Unknown);
            cb.mov(dst, RAX);

            // Leaf builtins don't touch locals, so their types survive
            return KeepCompiling;
        }
    }

    // Stack overflow check against a doubled frame, since vm_push_frame
    // itself checks one frame further
    add_comment(cb, "stack overflow check");
    let stack_max: i32 = unsafe { get_iseq_body_stack_max(iseq) }.try_into().unwrap();
    let headroom = (num_locals + stack_max) * SIZEOF_VALUE_I32
        + 2 * (RUBY_SIZEOF_CONTROL_FRAME as i32);
    cb.lea(REG0, ctx.sp_opnd(headroom as isize));
    cb.cmp(REG_CFP, REG0);
    cb.jcc_ptr(Cc::LE, counted_exit(ocb, exit, Counter::send_se_cf_overflow));

    // Receiver location, before we start moving SP
    let recv = ctx.stack_opnd(argc);

    // The caller's frame pops the receiver and arguments on return
    add_comment(cb, "store caller sp");
    cb.lea(REG0, ctx.sp_opnd((SIZEOF_VALUE as isize) * -((argc + 1) as isize)));
    cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SP), REG0);

    jit.save_next_pc(cb, REG0);

    if let Some(block_iseq) = block {
        // See gen_send_cfunc on block_code
        jit.load_gc_ref(cb, REG0, VALUE(block_iseq as usize));
        cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_BLOCK_CODE), REG0);
    }

    // Callee SP: args stay in place as the leading locals, the remaining
    // locals and the three env words follow
    let callee_sp_offs = (SIZEOF_VALUE as isize) * (3 + num_locals as isize);
    cb.lea(REG0, ctx.sp_opnd(callee_sp_offs));

    // Non-parameter locals start out nil
    for i in 0..num_locals {
        let offs = (i - num_locals - 3) * SIZEOF_VALUE_I32;
        cb.mov(Opnd::mem(64, REG0, offs), Opnd::uimm(Qnil.into()));
    }

    add_comment(cb, "push env");
    // sp[-3]: method entry (stable or this block would be gone)
    jit.load_gc_ref(cb, REG1, VALUE(cme as usize));
    cb.mov(Opnd::mem(64, REG0, 8 * -3), REG1);

    // sp[-2]: block handler
    if block.is_some() {
        cb.lea(REG1, Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SELF));
        cb.or(REG1, Opnd::imm(1));
        cb.mov(Opnd::mem(64, REG0, 8 * -2), REG1);
    } else {
        cb.mov(Opnd::mem(64, REG0, 8 * -2), Opnd::uimm(VM_BLOCK_HANDLER_NONE.into()));
    }

    // sp[-1]: frame type
    let frame_type = VM_FRAME_MAGIC_METHOD | VM_ENV_FLAG_LOCAL;
    cb.mov(Opnd::mem(64, REG0, 8 * -1), Opnd::uimm(frame_type.into()));

    add_comment(cb, "push callee CFP");
    cb.sub(REG_CFP, Opnd::uimm(RUBY_SIZEOF_CONTROL_FRAME as u64));
    cb.mov(Opnd::mem(64, REG_EC, RUBY_OFFSET_EC_CFP), REG_CFP);

    // Fill the callee frame. The PC is left for save_next_pc in the
    // callee; nothing reads it before then.
    cb.mov(REG1, recv);
    cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SELF), REG1);
    cb.mov(REG_SP, REG0); // we are the callee now
    cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SP), REG0);
    cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_BP), REG0);
    cb.sub(REG0, Opnd::uimm(SIZEOF_VALUE as u64));
    cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_EP), REG0);
    jit.load_gc_ref(cb, REG0, VALUE(iseq as usize));
    cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_ISEQ), REG0);
    cb.mov(Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_BLOCK_CODE), Opnd::imm(0));

    // The callee enters knowing its parameter types and receiver type
    let mut callee_ctx = Context::new();
    for arg_idx in 0..argc {
        let arg_type = ctx.get_opnd_type(Stack((argc - arg_idx - 1) as u16));
        callee_ctx.set_local_type(arg_idx as usize, arg_type);
    }
    let recv_type = ctx.get_opnd_type(Stack(argc as u16));
    callee_ctx.upgrade_opnd_type(SelfSlot, recv_type);

    // Whatever the callee does to our locals, we won't know about it
    ctx.clear_local_types();

    // Returning pops the call operands and pushes one unknown result;
    // sp_offset becomes 1 because `leave` writes the value through the
    // caller's stored SP, not past it
    let mut return_ctx = *ctx;
    return_ctx.stack_pop((argc + 1) as usize);
    return_ctx.stack_push(Type::Unknown);
    return_ctx.set_sp_offset(1);
    return_ctx.reset_chain_depth();

    let return_block = BlockId {
        iseq: jit.iseq,
        idx: jit.next_insn_idx(),
    };

    // cfp->jit_return = the (stub for the) continuation after this call
    gen_branch(
        jit,
        cb,
        ocb,
        return_block,
        &return_ctx,
        Some(return_block),
        Some(&return_ctx),
        BranchGenFn::SetJitReturn,
    );

    // Enter the callee at its chosen start PC
    gen_direct_jump(
        jit,
        &callee_ctx,
        BlockId {
            iseq,
            idx: start_pc_offset,
        },
        cb,
    );

    EndBlock
}

/// Struct field reader method (Struct.new(...) accessors)
fn gen_struct_aref(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    ci: *const rb_callinfo,
    cme: *const rb_callable_method_entry_t,
    comptime_recv: VALUE,
) -> CodegenStatus {
    if unsafe { vm_ci_argc(ci) } != 0 {
        return CantCompile;
    }

    let off: i32 = unsafe { get_cme_def_body_optimized_index(cme) }
        .try_into()
        .unwrap();

    assert!(unsafe { RB_TYPE_P(comptime_recv, RUBY_T_STRUCT) });
    assert!((off as i64) < unsafe { RSTRUCT_LEN(comptime_recv) });

    // The displacement must fit the addressing mode
    if (off as i64) * (SIZEOF_VALUE as i64) > i32::MAX as i64 {
        return CantCompile;
    }

    // Structs of one class share a layout, so the sample's embeddedness
    // holds for every instance the class guard lets through
    let embedded = unsafe { FL_TEST_RAW(comptime_recv, VALUE(RSTRUCT_EMBED_LEN_MASK)) } != VALUE(0);

    add_comment(cb, "struct aref");

    let recv = ctx.stack_pop(1);
    cb.mov(REG0, recv);

    if embedded {
        cb.mov(REG0, Opnd::mem(64, REG0, RUBY_OFFSET_RSTRUCT_AS_ARY + 8 * off));
    } else {
        cb.mov(REG0, Opnd::mem(64, REG0, RUBY_OFFSET_RSTRUCT_AS_HEAP_PTR));
        cb.mov(REG0, Opnd::mem(64, REG0, SIZEOF_VALUE_I32 * off));
    }

    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, REG0);

    jump_to_next_insn(jit, ctx, cb, ocb);
    EndBlock
}

/// Struct field writer method
fn gen_struct_aset(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    ci: *const rb_callinfo,
    cme: *const rb_callable_method_entry_t,
    comptime_recv: VALUE,
) -> CodegenStatus {
    if unsafe { vm_ci_argc(ci) } != 1 {
        return CantCompile;
    }

    let off: i32 = unsafe { get_cme_def_body_optimized_index(cme) }
        .try_into()
        .unwrap();

    assert!(unsafe { RB_TYPE_P(comptime_recv, RUBY_T_STRUCT) });
    assert!((off as i64) < unsafe { RSTRUCT_LEN(comptime_recv) });

    add_comment(cb, "struct aset");

    let val = ctx.stack_pop(1);
    let recv = ctx.stack_pop(1);

    // The helper handles the layout split and the write barrier
    cb.mov(C_ARG_REGS[0], recv);
    cb.mov(C_ARG_REGS[1], Opnd::imm(off as i64));
    cb.mov(C_ARG_REGS[2], val);
    cb.call_ptr(REG0, RSTRUCT_SET as *const u8);

    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, RAX);

    jump_to_next_insn(jit, ctx, cb, ocb);
    EndBlock
}

/// Protected methods only dispatch when self is_a? the defining class;
/// emit that check. rb_obj_is_kind_of doesn't raise, so no PC sync.
fn jit_protected_callee_ancestry_guard(
    jit: &mut JITState,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    cme: *const rb_callable_method_entry_t,
    side_exit: CodePtr,
) {
    cb.mov(C_ARG_REGS[0], Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SELF));
    let defined_class = unsafe { (*cme).defined_class };
    jit.load_gc_ref(cb, C_ARG_REGS[1], defined_class);

    cb.call_ptr(REG0, rb_obj_is_kind_of as *const u8);
    cb.test(RAX, RAX);
    cb.jcc_ptr(
        Cc::E,
        counted_exit(ocb, side_exit, Counter::send_se_protected_check_failed),
    );
}

/// The common call pipeline behind send, opt_send_without_block and the
/// opt_* fallbacks: restrict to simple call shapes, specialize on the
/// observed receiver class, resolve and pin the method, enforce
/// visibility, then hand off by method kind.
fn gen_send_general(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
    cd: *const rb_call_data,
    block: Option<IseqPtr>,
) -> CodegenStatus {
    let ci = unsafe { get_call_data_ci(cd) };
    let argc = unsafe { vm_ci_argc(ci) };
    let mid = unsafe { vm_ci_mid(ci) };
    let flags = unsafe { vm_ci_flag(ci) };

    // The fast path covers only "simple" call sites (with an optional
    // literal block). Splats, keyword args and block args all reshape the
    // stack and stay interpreted.
    if flags & VM_CALL_KW_SPLAT != 0 {
        gen_counter_incr(cb, Counter::send_kw_splat);
        return CantCompile;
    }
    if flags & VM_CALL_KWARG != 0 {
        gen_counter_incr(cb, Counter::send_keywords);
        return CantCompile;
    }
    if flags & VM_CALL_ARGS_SPLAT != 0 {
        gen_counter_incr(cb, Counter::send_args_splat);
        return CantCompile;
    }
    if flags & VM_CALL_ARGS_BLOCKARG != 0 {
        gen_counter_incr(cb, Counter::send_block_arg);
        return CantCompile;
    }

    // Specialization needs an observed receiver
    if !jit.at_current_insn() {
        defer_compilation(jit, ctx, cb, ocb);
        return EndBlock;
    }

    let comptime_recv = jit.peek_stack(ctx, argc as isize);
    let comptime_recv_klass = comptime_recv.class_of();

    let exit = side_exit(jit, ocb, ctx);

    // Pin the receiver to the observed class
    let recv = ctx.stack_opnd(argc);
    let recv_slot = Stack(argc as u16);
    cb.mov(REG0, recv);
    jit_guard_known_klass(
        jit,
        ctx,
        cb,
        ocb,
        comptime_recv_klass,
        recv_slot,
        comptime_recv,
        SEND_MAX_DEPTH,
        exit,
    );

    // Method lookup, at compile time and only once
    let mut cme = unsafe { rb_callable_method_entry(comptime_recv_klass, mid) };
    if cme.is_null() {
        return CantCompile;
    }

    match unsafe { METHOD_ENTRY_VISI(cme) } {
        METHOD_VISI_PUBLIC => {
            // Anyone may call
        }
        METHOD_VISI_PRIVATE => {
            // Only receiverless call sites (or explicit self) reach
            // private methods
            if flags & VM_CALL_FCALL == 0 {
                return CantCompile;
            }
        }
        METHOD_VISI_PROTECTED => {
            jit_protected_callee_ancestry_guard(jit, cb, ocb, cme, exit);
        }
        _ => {
            panic!("method entry with no visibility");
        }
    }

    // The block dies with this lookup result
    assume_method_lookup_stable(jit, ocb, comptime_recv_klass, cme);

    // Aliases resolve to their origin and re-dispatch
    loop {
        return match unsafe { get_cme_def_type(cme) } {
            VM_METHOD_TYPE_ISEQ => gen_send_iseq(jit, ctx, cb, ocb, ci, cme, block, argc),
            VM_METHOD_TYPE_CFUNC => gen_send_cfunc(
                jit,
                ctx,
                cb,
                ocb,
                ci,
                cme,
                block,
                argc,
                &comptime_recv_klass,
            ),
            VM_METHOD_TYPE_IVAR => {
                if argc != 0 {
                    // Getters take no arguments
                    gen_counter_incr(cb, Counter::send_getter_arity);
                    return CantCompile;
                }
                if c_method_tracing_currently_enabled(jit) {
                    // An attr_reader never enables tracing itself, and
                    // global invalidation catches later enablement at the
                    // instruction boundary; but with tracing already on we
                    // must not skip the events.
                    gen_counter_incr(cb, Counter::send_cfunc_tracing);
                    return CantCompile;
                }

                cb.mov(REG0, recv);
                let ivar_name = unsafe { get_cme_def_body_attr_id(cme) };
                gen_get_ivar(
                    jit,
                    ctx,
                    cb,
                    ocb,
                    SEND_MAX_DEPTH,
                    comptime_recv,
                    ivar_name,
                    recv_slot,
                    exit,
                )
            }
            VM_METHOD_TYPE_ALIAS => {
                // Dispatch again on the original entry
                cme = unsafe { rb_aliased_callable_method_entry(cme) };
                continue;
            }
            VM_METHOD_TYPE_OPTIMIZED => {
                match unsafe { get_cme_def_body_optimized_type(cme) } {
                    OPTIMIZED_METHOD_TYPE_STRUCT_AREF => {
                        gen_struct_aref(jit, ctx, cb, ocb, ci, cme, comptime_recv)
                    }
                    OPTIMIZED_METHOD_TYPE_STRUCT_ASET => {
                        gen_struct_aset(jit, ctx, cb, ocb, ci, cme, comptime_recv)
                    }
                    OPTIMIZED_METHOD_TYPE_SEND => {
                        gen_counter_incr(cb, Counter::send_optimized_method_send);
                        CantCompile
                    }
                    OPTIMIZED_METHOD_TYPE_CALL => {
                        gen_counter_incr(cb, Counter::send_optimized_method_call);
                        CantCompile
                    }
                    OPTIMIZED_METHOD_TYPE_BLOCK_CALL => {
                        gen_counter_incr(cb, Counter::send_optimized_method_block_call);
                        CantCompile
                    }
                    _ => panic!("unknown optimized method kind"),
                }
            }
            // Writes need a write barrier, blocks need materialization,
            // zsuper and refinements need scope walks: all interpreted
            VM_METHOD_TYPE_ATTRSET => {
                gen_counter_incr(cb, Counter::send_ivar_set_method);
                CantCompile
            }
            VM_METHOD_TYPE_BMETHOD => {
                gen_counter_incr(cb, Counter::send_bmethod);
                CantCompile
            }
            VM_METHOD_TYPE_ZSUPER => {
                gen_counter_incr(cb, Counter::send_zsuper_method);
                CantCompile
            }
            VM_METHOD_TYPE_MISSING => {
                gen_counter_incr(cb, Counter::send_missing_method);
                CantCompile
            }
            VM_METHOD_TYPE_REFINED => {
                gen_counter_incr(cb, Counter::send_refined_method);
                CantCompile
            }
            VM_METHOD_TYPE_UNDEF => {
                gen_counter_incr(cb, Counter::send_undef_method);
                CantCompile
            }
            VM_METHOD_TYPE_NOTIMPLEMENTED => {
                gen_counter_incr(cb, Counter::send_not_implemented_method);
                CantCompile
            }
            _ => unreachable!("unknown method kind"),
        };
    }
}

fn gen_opt_send_without_block(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let cd = jit.arg(0).as_ptr();
    gen_send_general(jit, ctx, cb, ocb, cd, None)
}

fn gen_send(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let cd = jit.arg(0).as_ptr();
    let block: Option<IseqPtr> = jit.arg(1).as_optional_ptr();
    gen_send_general(jit, ctx, cb, ocb, cd, block)
}

/// Super calls specialize on the lexically current method entry. Both the
/// current entry and the resolved super entry get stability assumptions.
fn gen_invokesuper(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let cd: *const rb_call_data = jit.arg(0).as_ptr();
    let block: Option<IseqPtr> = jit.arg(1).as_optional_ptr();

    if !jit.at_current_insn() {
        defer_compilation(jit, ctx, cb, ocb);
        return EndBlock;
    }

    let me = unsafe { rb_vm_frame_method_entry(get_ec_cfp(jit.ec.unwrap())) };
    if me.is_null() {
        return CantCompile;
    }

    // The lexical origin decides where the super search starts.
    // FIXME: invalidation of this cme should invalidate this block
    let current_defined_class = unsafe { (*me).defined_class };
    let mid = unsafe { get_def_original_id((*me).def) };

    // The stability assumption below also requires the entry to still be
    // what lookup returns
    if me != unsafe { rb_callable_method_entry(current_defined_class, (*me).called_id) } {
        return CantCompile;
    }

    // Refinement scopes resolve super dynamically; leave those alone.
    // See vm_search_normal_superclass.
    let rbasic_ptr: *const RBasic = current_defined_class.as_ptr();
    if current_defined_class.builtin_type() == RUBY_T_ICLASS
        && unsafe {
            RB_TYPE_P((*rbasic_ptr).klass, RUBY_T_MODULE)
                && FL_TEST_RAW((*rbasic_ptr).klass, VALUE(RMODULE_IS_REFINEMENT.as_usize()))
                    != VALUE(0)
        }
    {
        return CantCompile;
    }
    let comptime_superclass =
        unsafe { rb_class_get_superclass(RCLASS_ORIGIN(current_defined_class)) };

    let ci = unsafe { get_call_data_ci(cd) };
    let argc = unsafe { vm_ci_argc(ci) };
    let ci_flags = unsafe { vm_ci_flag(ci) };

    // Same simple-shape restrictions as ordinary sends
    if ci_flags & VM_CALL_KW_SPLAT != 0 {
        gen_counter_incr(cb, Counter::send_kw_splat);
        return CantCompile;
    }
    if ci_flags & VM_CALL_KWARG != 0 {
        gen_counter_incr(cb, Counter::send_keywords);
        return CantCompile;
    }
    if ci_flags & VM_CALL_ARGS_SPLAT != 0 {
        gen_counter_incr(cb, Counter::send_args_splat);
        return CantCompile;
    }
    if ci_flags & VM_CALL_ARGS_BLOCKARG != 0 {
        gen_counter_incr(cb, Counter::send_block_arg);
        return CantCompile;
    }

    // The method may have been rebound onto an incompatible class; since
    // we key on the method entry this is a one-time compile-time check
    let comptime_recv = jit.peek_stack(ctx, argc as isize);
    if unsafe { rb_obj_is_kind_of(comptime_recv, current_defined_class) } == VALUE(0) {
        return CantCompile;
    }

    let cme = unsafe { rb_callable_method_entry(comptime_superclass, mid) };
    if cme.is_null() {
        return CantCompile;
    }

    // Know before emitting guards whether dispatch is possible
    let cme_def_type = unsafe { get_cme_def_type(cme) };
    if cme_def_type != VM_METHOD_TYPE_ISEQ && cme_def_type != VM_METHOD_TYPE_CFUNC {
        return CantCompile;
    }

    let exit = side_exit(jit, ocb, ctx);

    // A block that rebinds its method entry (eg: define_method bodies)
    // stores it in the environment; super inside those stays interpreted
    let ep = unsafe { get_cfp_ep(get_ec_cfp(jit.ec.unwrap())) };
    let cref_me = unsafe { *ep.offset(VM_ENV_DATA_INDEX_ME_CREF as isize) };
    let me_as_value = VALUE(me as usize);
    if cref_me != me_as_value {
        return CantCompile;
    }

    // Guard that the frame still belongs to the same method entry
    add_comment(cb, "guard known me");
    cb.mov(REG0, Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_EP));
    let ep_me_opnd = Opnd::mem(64, REG0, SIZEOF_VALUE_I32 * VM_ENV_DATA_INDEX_ME_CREF);
    jit.load_gc_ref(cb, REG1, me_as_value);
    cb.cmp(ep_me_opnd, REG1);
    cb.jcc_ptr(Cc::NE, counted_exit(ocb, exit, Counter::invokesuper_me_changed));

    if block.is_none() {
        // A block would be forwarded implicitly; guard that there is none.
        // TODO: forwarding the block handler would lift this.
        add_comment(cb, "guard no block given");
        // EP still in REG0
        let ep_specval_opnd = Opnd::mem(64, REG0, SIZEOF_VALUE_I32 * VM_ENV_DATA_INDEX_SPECVAL);
        cb.cmp(ep_specval_opnd, Opnd::uimm(VM_BLOCK_HANDLER_NONE.into()));
        cb.jcc_ptr(Cc::NE, counted_exit(ocb, exit, Counter::invokesuper_block));
    }

    // Dispatch expects the receiver in REG0
    cb.mov(REG0, ctx.stack_opnd(argc));

    // Both lookups must stay stable for this code to stay valid
    assume_method_lookup_stable(jit, ocb, current_defined_class, me);
    assume_method_lookup_stable(jit, ocb, comptime_superclass, cme);

    // The callee can rebind our locals
    ctx.clear_local_types();

    match cme_def_type {
        VM_METHOD_TYPE_ISEQ => gen_send_iseq(jit, ctx, cb, ocb, ci, cme, block, argc),
        VM_METHOD_TYPE_CFUNC => {
            gen_send_cfunc(jit, ctx, cb, ocb, ci, cme, block, argc, ptr::null())
        }
        _ => unreachable!(),
    }
}

/// Return from a compiled method: pop the frame and jump wherever the
/// caller's jit_return points (compiled code or the leave exit)
fn gen_leave(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // All that's left on the stack is the return value
    assert!(ctx.get_stack_size() == 1);

    let exit = side_exit(jit, ocb, ctx);

    gen_check_ints(cb, counted_exit(ocb, exit, Counter::leave_se_interrupt));

    // Return value before we lose our SP
    cb.mov(REG0, ctx.stack_pop(1));

    // Drop the frame: control frames grow down, so popping is an add
    add_comment(cb, "pop stack frame");
    cb.add(REG_CFP, Opnd::uimm(RUBY_SIZEOF_CONTROL_FRAME as u64));
    cb.mov(Opnd::mem(64, REG_EC, RUBY_OFFSET_EC_CFP), REG_CFP);

    // The caller's sp_offset is 1: write the return value at its SP top
    cb.mov(REG_SP, Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SP));
    cb.mov(Opnd::mem(64, REG_SP, 0), REG0);

    // Continue at the jit_return stored in the frame we just popped
    let jit_return_offs = RUBY_OFFSET_CFP_JIT_RETURN - RUBY_SIZEOF_CONTROL_FRAME as i32;
    cb.jmp_opnd(Opnd::mem(64, REG_CFP, jit_return_offs));

    EndBlock
}

//===========================================================================
// Globals, conversions and specials
//===========================================================================

fn gen_getglobal(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let gid = jit.arg(0);

    // Reading a global can run a trace var hook
    jit.prepare_routine_call(ctx, cb, REG0);

    cb.mov(C_ARG_REGS[0], Opnd::imm(gid.as_i64()));
    cb.call_ptr(REG0, rb_gvar_get as *const u8);

    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_setglobal(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let gid = jit.arg(0);

    // Kernel#trace_var hooks run on assignment
    jit.prepare_routine_call(ctx, cb, REG0);

    let val = ctx.stack_pop(1);
    cb.mov(C_ARG_REGS[0], Opnd::imm(gid.as_i64()));
    cb.mov(C_ARG_REGS[1], val);
    cb.call_ptr(REG0, rb_gvar_set as *const u8);

    KeepCompiling
}

fn gen_anytostring(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // Can call #to_s
    jit.prepare_routine_call(ctx, cb, REG0);

    let str = ctx.stack_pop(1);
    let val = ctx.stack_pop(1);

    cb.mov(C_ARG_REGS[0], str);
    cb.mov(C_ARG_REGS[1], val);
    cb.call_ptr(REG0, rb_obj_as_string_result as *const u8);

    let dst = ctx.stack_push(Type::String);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_objtostring(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    if !jit.at_current_insn() {
        defer_compilation(jit, ctx, cb, ocb);
        return EndBlock;
    }

    let comptime_recv = jit.peek_stack(ctx, 0);

    if unsafe { RB_TYPE_P(comptime_recv, RUBY_T_STRING) } {
        let exit = side_exit(jit, ocb, ctx);

        cb.mov(REG0, ctx.stack_opnd(0));
        jit_guard_known_klass(
            jit,
            ctx,
            cb,
            ocb,
            comptime_recv.class_of(),
            Stack(0),
            comptime_recv,
            SEND_MAX_DEPTH,
            exit,
        );
        // Strings interpolate as themselves; the operand stays put
        KeepCompiling
    } else {
        // Everything else calls its #to_s
        let cd = jit.arg(0).as_ptr();
        gen_send_general(jit, ctx, cb, ocb, cd, None)
    }
}

fn gen_intern(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // Interning can allocate the symbol
    jit.prepare_routine_call(ctx, cb, REG0);

    let str = ctx.stack_pop(1);
    cb.mov(C_ARG_REGS[0], str);
    cb.call_ptr(REG0, rb_str_intern as *const u8);

    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, RAX);

    KeepCompiling
}

fn gen_toregexp(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let opt = jit.arg(0).as_i64();
    let cnt = jit.arg(1).as_usize();

    // Allocates, and regexp compilation can raise
    jit.prepare_routine_call(ctx, cb, REG0);

    let values_ptr = ctx.sp_opnd(-((SIZEOF_VALUE as isize) * (cnt as isize)));
    ctx.stack_pop(cnt);

    // Collect the parts into a temporary array
    cb.mov(C_ARG_REGS[0], Opnd::imm(0));
    cb.mov(C_ARG_REGS[1], Opnd::imm(cnt.try_into().unwrap()));
    cb.lea(C_ARG_REGS[2], values_ptr);
    cb.call_ptr(REG0, rb_ary_tmp_new_from_values as *const u8);

    // Hold the array across the regexp call so it can be cleared after
    // (twice for stack alignment)
    cb.push(RAX);
    cb.push(RAX);
    cb.mov(C_ARG_REGS[0], RAX);
    cb.mov(C_ARG_REGS[1], Opnd::imm(opt));
    cb.call_ptr(REG0, rb_reg_new_ary as *const u8);

    cb.pop(REG1);
    cb.pop(C_ARG_REGS[0]);

    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, RAX);

    // Empty the temporary eagerly
    cb.call_ptr(REG0, rb_ary_clear as *const u8);

    KeepCompiling
}

fn gen_getspecial(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // (key, type) operands; a zero type reads $~ and friends, which this
    // doesn't handle
    let rtype = jit.arg(1).as_u64();
    if rtype == 0 {
        return CantCompile;
    }

    // Both forms can raise on an uninitialized match
    jit.prepare_routine_call(ctx, cb, REG0);

    add_comment(cb, "rb_backref_get");
    cb.call_ptr(REG0, rb_backref_get as *const u8);

    if rtype & 0x01 != 0 {
        // Character-coded backref: $&, $`, $', $+
        cb.mov(C_ARG_REGS[0], RAX);
        let getter: *const u8 = match (rtype >> 1) as u8 as char {
            '&' => rb_reg_last_match as *const u8,
            '`' => rb_reg_match_pre as *const u8,
            '\'' => rb_reg_match_post as *const u8,
            '+' => rb_reg_match_last as *const u8,
            _ => panic!("invalid back-ref code"),
        };
        cb.call_ptr(REG0, getter);
    } else {
        // Numbered capture group
        add_comment(cb, "rb_reg_nth_match");
        cb.mov(C_ARG_REGS[0], Opnd::imm((rtype >> 1).try_into().unwrap()));
        cb.mov(C_ARG_REGS[1], RAX);
        cb.call_ptr(REG0, rb_reg_nth_match as *const u8);
    }

    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, RAX);

    KeepCompiling
}

//===========================================================================
// Constants
//===========================================================================

fn gen_opt_getinlinecache(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let jump_offset = jit.arg(0);
    let ic: *const iseq_inline_constant_cache = jit.arg(1).as_ptr();

    let ice = unsafe { (*ic).entry };
    if ice.is_null() {
        // Empty cache: leave a side-exiting block that the cache fill
        // will invalidate and recompile
        return CantCompile;
    }

    // The cache-fill callback may want to invalidate this block
    jit_ensure_block_entry_exit(jit, ocb);

    if !unsafe { (*ice).ic_cref }.is_null() {
        // Lexically scoped constant: validity depends on the cref, so
        // re-check the interpreter's cache at run time
        let exit = side_exit(jit, ocb, ctx);

        // rb_vm_ic_hit_p(ic, ep): leaf, no sync needed
        cb.mov(C_ARG_REGS[0], Opnd::const_ptr(ic as *const u8));
        cb.mov(C_ARG_REGS[1], Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_EP));
        cb.call_ptr(REG0, rb_vm_ic_hit_p as *const u8);

        // SysV bools come back in the low byte
        cb.test(AL, AL);
        cb.jcc_ptr(Cc::E, counted_exit(ocb, exit, Counter::opt_getinlinecache_miss));

        // Read ic->entry->value fresh; the cache may repoint it
        cb.mov(REG0, Opnd::const_ptr(ic as *const u8));
        cb.mov(REG0, Opnd::mem(64, REG0, RUBY_OFFSET_IC_ENTRY));
        cb.mov(REG0, Opnd::mem(64, REG0, RUBY_OFFSET_ICE_VALUE));

        let dst = ctx.stack_push(Type::Unknown);
        cb.mov(dst, REG0);
    } else {
        // Globally scoped constant: bake the value in, guarded by the
        // single-ractor and constant-stability assumptions
        if !assume_single_ractor_mode(jit, ocb) {
            return CantCompile;
        }
        assume_stable_constant_state(jit, ocb);

        jit_putobject(jit, ctx, cb, unsafe { (*ice).value });
    }

    // Skip over the cache-fill instructions to the end of the cached
    // region
    let jump_idx = jit.next_insn_idx() + jump_offset.as_u32();
    gen_direct_jump(
        jit,
        ctx,
        BlockId {
            iseq: jit.iseq,
            idx: jump_idx,
        },
        cb,
    );
    EndBlock
}

//===========================================================================
// Block parameters
//===========================================================================

fn gen_getblockparamproxy(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    // Only the current frame's block parameter is proxied
    if jit.arg(1).as_u32() != 0 {
        return CantCompile;
    }

    let exit = side_exit(jit, ocb, ctx);

    gen_get_ep(cb, REG0, 0);

    // Once the parameter has been written, the proxy trick is off
    let flags_opnd = Opnd::mem(64, REG0, SIZEOF_VALUE_I32 * VM_ENV_DATA_INDEX_FLAGS);
    cb.test(flags_opnd, Opnd::uimm(VM_FRAME_FLAG_MODIFIED_BLOCK_PARAM.into()));
    cb.jcc_ptr(Cc::NE, counted_exit(ocb, exit, Counter::gbpp_block_param_modified));

    // The proxy only stands in for an iseq block (tag 0b01 in the block
    // handler; see VM_BH_ISEQ_BLOCK_P). Null fails the same check.
    cb.mov(REG0, Opnd::mem(64, REG0, SIZEOF_VALUE_I32 * VM_ENV_DATA_INDEX_SPECVAL));
    cb.and(REG0_8, Opnd::imm(0x3));
    cb.cmp(REG0_8, Opnd::imm(0x1));
    cb.jcc_ptr(Cc::NE, counted_exit(ocb, exit, Counter::gbpp_block_handler_not_iseq));

    // The proxy singleton is a GC root; no offset recording needed
    cb.mov(REG0, Opnd::const_ptr(unsafe { rb_block_param_proxy }.as_ptr()));
    assert!(!unsafe { rb_block_param_proxy }.special_const_p());
    let dst = ctx.stack_push(Type::UnknownHeap);
    cb.mov(dst, REG0);

    KeepCompiling
}

fn gen_getblockparam(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let level = jit.arg(1).as_u32();

    // Materializing the proc allocates
    jit.prepare_routine_call(ctx, cb, REG0);

    let exit = side_exit(jit, ocb, ctx);

    gen_get_ep(cb, REG1, level);

    let flags_opnd = Opnd::mem(64, REG1, SIZEOF_VALUE_I32 * VM_ENV_DATA_INDEX_FLAGS);
    cb.test(flags_opnd, Opnd::uimm(VM_FRAME_FLAG_MODIFIED_BLOCK_PARAM.into()));

    // Already materialized: the env slot holds the proc
    let modified = cb.new_label("modified");
    cb.jcc_label(Cc::NE, modified);

    // We're about to write the proc into the env; if that write needs a
    // barrier, let the interpreter do the whole thing
    cb.test(flags_opnd, Opnd::imm(VM_ENV_FLAG_WB_REQUIRED as i64));
    cb.jcc_ptr(Cc::NE, exit);

    // rb_vm_bh_to_procval(ec, block_handler)
    cb.mov(
        C_ARG_REGS[1],
        Opnd::mem(64, REG1, SIZEOF_VALUE_I32 * VM_ENV_DATA_INDEX_SPECVAL),
    );
    cb.mov(C_ARG_REGS[0], REG_EC);
    cb.call_ptr(REG0, rb_vm_bh_to_procval as *const u8);

    // The call clobbered REG1; find the env again, mark it modified, and
    // store the proc in the parameter's slot
    gen_get_ep(cb, REG1, level);
    let flags_opnd = Opnd::mem(64, REG1, SIZEOF_VALUE_I32 * VM_ENV_DATA_INDEX_FLAGS);
    cb.or(flags_opnd, Opnd::uimm(VM_FRAME_FLAG_MODIFIED_BLOCK_PARAM.into()));

    let slot_idx = jit.arg(0).as_i32();
    let slot_offs = -SIZEOF_VALUE_I32 * slot_idx;
    cb.mov(Opnd::mem(64, REG1, slot_offs), RAX);

    cb.write_label(modified);

    // Either way the slot now holds the proc
    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(RAX, Opnd::mem(64, REG1, slot_offs));
    cb.mov(dst, RAX);

    cb.link_labels();

    KeepCompiling
}

//===========================================================================
// Builtin functions
//===========================================================================

fn gen_invokebuiltin(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let bf: *const rb_builtin_function = jit.arg(0).as_ptr();
    let bf_argc: usize = unsafe { (*bf).argc }.try_into().expect("non negative argc");

    // ec and self occupy the first two argument registers
    if bf_argc + 2 > C_ARG_REGS.len() {
        return CantCompile;
    }

    // Builtins can do anything a C function can
    jit.prepare_routine_call(ctx, cb, REG0);

    cb.mov(C_ARG_REGS[0], REG_EC);
    cb.mov(C_ARG_REGS[1], Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SELF));

    // Arguments come off the stack top
    for i in 0..bf_argc {
        cb.mov(C_ARG_REGS[2 + i], ctx.stack_opnd((bf_argc - i - 1) as i32));
    }

    cb.call_ptr(REG0, unsafe { (*bf).func_ptr } as *const u8);

    ctx.stack_pop(bf_argc);
    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, RAX);

    KeepCompiling
}

/// Like invokebuiltin, but the arguments come from the method's leading
/// locals rather than the stack
fn gen_opt_invokebuiltin_delegate(
    jit: &mut JITState,
    ctx: &mut Context,
    cb: &mut CodeBlock,
    _ocb: &mut OutlinedCb,
) -> CodegenStatus {
    let bf: *const rb_builtin_function = jit.arg(0).as_ptr();
    let bf_argc = unsafe { (*bf).argc };
    let start_index = jit.arg(1).as_i32();

    if bf_argc + 2 > C_ARG_REGS.len() as i32 {
        return CantCompile;
    }

    jit.prepare_routine_call(ctx, cb, REG0);

    if bf_argc > 0 {
        cb.mov(REG0, Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_EP));
    }

    cb.mov(C_ARG_REGS[0], REG_EC);
    cb.mov(C_ARG_REGS[1], Opnd::mem(64, REG_CFP, RUBY_OFFSET_CFP_SELF));

    // Locals are addressed down from the EP
    for i in 0..bf_argc {
        let table_size = unsafe { get_iseq_body_local_table_size(jit.iseq) };
        let local_offs: i32 =
            1 + start_index + i - (table_size as i32) - (VM_ENV_DATA_SIZE as i32);
        cb.mov(
            C_ARG_REGS[(i + 2) as usize],
            Opnd::mem(64, REG0, local_offs * SIZEOF_VALUE_I32),
        );
    }

    cb.call_ptr(REG0, unsafe { (*bf).func_ptr } as *const u8);

    let dst = ctx.stack_push(Type::Unknown);
    cb.mov(dst, RAX);

    KeepCompiling
}

//===========================================================================
// Dispatch table and global codegen state
//===========================================================================

/// The per-opcode dispatch table. Opcodes without an entry exit to the
/// interpreter.
fn get_gen_fn(opcode: VALUE) -> Option<InsnGenFn> {
    let VALUE(opcode) = opcode;
    let opcode = opcode as ruby_vminsn_type;
    assert!(opcode < VM_INSTRUCTION_SIZE);

    match opcode {
        // Stack shuffling
        YARVINSN_nop => Some(gen_nop),
        YARVINSN_pop => Some(gen_pop),
        YARVINSN_dup => Some(gen_dup),
        YARVINSN_dupn => Some(gen_dupn),
        YARVINSN_swap => Some(gen_swap),
        YARVINSN_setn => Some(gen_setn),
        YARVINSN_topn => Some(gen_topn),
        YARVINSN_adjuststack => Some(gen_adjuststack),

        // Literals
        YARVINSN_putnil => Some(gen_putnil),
        YARVINSN_putobject => Some(gen_putobject),
        YARVINSN_putobject_INT2FIX_0_ => Some(gen_putobject_int2fix),
        YARVINSN_putobject_INT2FIX_1_ => Some(gen_putobject_int2fix),
        YARVINSN_putself => Some(gen_putself),
        YARVINSN_putspecialobject => Some(gen_putspecialobject),
        YARVINSN_putstring => Some(gen_putstring),

        // Locals
        YARVINSN_getlocal => Some(gen_getlocal),
        YARVINSN_getlocal_WC_0 => Some(gen_getlocal_wc0),
        YARVINSN_getlocal_WC_1 => Some(gen_getlocal_wc1),
        YARVINSN_setlocal => Some(gen_setlocal),
        YARVINSN_setlocal_WC_0 => Some(gen_setlocal_wc0),
        YARVINSN_setlocal_WC_1 => Some(gen_setlocal_wc1),

        // Instance variables and globals
        YARVINSN_getinstancevariable => Some(gen_getinstancevariable),
        YARVINSN_setinstancevariable => Some(gen_setinstancevariable),
        YARVINSN_getglobal => Some(gen_getglobal),
        YARVINSN_setglobal => Some(gen_setglobal),

        // Constructors
        YARVINSN_newarray => Some(gen_newarray),
        YARVINSN_duparray => Some(gen_duparray),
        YARVINSN_newhash => Some(gen_newhash),
        YARVINSN_duphash => Some(gen_duphash),
        YARVINSN_newrange => Some(gen_newrange),
        YARVINSN_splatarray => Some(gen_splatarray),
        YARVINSN_expandarray => Some(gen_expandarray),
        YARVINSN_concatstrings => Some(gen_concatstrings),

        // Specialized operators
        YARVINSN_opt_plus => Some(gen_opt_plus),
        YARVINSN_opt_minus => Some(gen_opt_minus),
        YARVINSN_opt_and => Some(gen_opt_and),
        YARVINSN_opt_or => Some(gen_opt_or),
        YARVINSN_opt_lt => Some(gen_opt_lt),
        YARVINSN_opt_le => Some(gen_opt_le),
        YARVINSN_opt_gt => Some(gen_opt_gt),
        YARVINSN_opt_ge => Some(gen_opt_ge),
        YARVINSN_opt_eq => Some(gen_opt_eq),
        YARVINSN_opt_neq => Some(gen_opt_neq),
        YARVINSN_opt_aref => Some(gen_opt_aref),
        YARVINSN_opt_aset => Some(gen_opt_aset),
        YARVINSN_opt_mod => Some(gen_opt_mod),
        YARVINSN_opt_str_freeze => Some(gen_opt_str_freeze),
        YARVINSN_opt_str_uminus => Some(gen_opt_str_uminus),
        YARVINSN_opt_case_dispatch => Some(gen_opt_case_dispatch),

        // Unspecialized operators that degrade to sends
        YARVINSN_opt_mult => Some(gen_opt_mult),
        YARVINSN_opt_div => Some(gen_opt_div),
        YARVINSN_opt_ltlt => Some(gen_opt_ltlt),
        YARVINSN_opt_nil_p => Some(gen_opt_nil_p),
        YARVINSN_opt_empty_p => Some(gen_opt_empty_p),
        YARVINSN_opt_succ => Some(gen_opt_succ),
        YARVINSN_opt_not => Some(gen_opt_not),
        YARVINSN_opt_size => Some(gen_opt_size),
        YARVINSN_opt_length => Some(gen_opt_length),
        YARVINSN_opt_regexpmatch2 => Some(gen_opt_regexpmatch2),

        // Checks and queries
        YARVINSN_defined => Some(gen_defined),
        YARVINSN_checktype => Some(gen_checktype),
        YARVINSN_checkkeyword => Some(gen_checkkeyword),

        // Control flow
        YARVINSN_branchif => Some(gen_branchif),
        YARVINSN_branchunless => Some(gen_branchunless),
        YARVINSN_branchnil => Some(gen_branchnil),
        YARVINSN_jump => Some(gen_jump),
        YARVINSN_leave => Some(gen_leave),

        // Calls
        YARVINSN_send => Some(gen_send),
        YARVINSN_opt_send_without_block => Some(gen_opt_send_without_block),
        YARVINSN_invokesuper => Some(gen_invokesuper),
        YARVINSN_invokebuiltin => Some(gen_invokebuiltin),
        YARVINSN_opt_invokebuiltin_delegate => Some(gen_opt_invokebuiltin_delegate),
        YARVINSN_opt_invokebuiltin_delegate_leave => Some(gen_opt_invokebuiltin_delegate),

        // Constants and conversions
        YARVINSN_opt_getinlinecache => Some(gen_opt_getinlinecache),
        YARVINSN_anytostring => Some(gen_anytostring),
        YARVINSN_objtostring => Some(gen_objtostring),
        YARVINSN_intern => Some(gen_intern),
        YARVINSN_toregexp => Some(gen_toregexp),
        YARVINSN_getspecial => Some(gen_getspecial),

        // Block parameters
        YARVINSN_getblockparamproxy => Some(gen_getblockparamproxy),
        YARVINSN_getblockparam => Some(gen_getblockparam),

        _ => None,
    }
}

/// Specialization lookup for a cfunc, keyed on its method serial
fn lookup_cfunc_codegen(def: *const rb_method_definition_t) -> Option<MethodGenFn> {
    let serial = unsafe { get_def_method_serial(def) };
    CodegenGlobals::look_up_codegen_method(serial)
}

/// Process-wide codegen state: the two arenas, the shared exit sequences,
/// the tracing patch list, and the cfunc specialization table. All
/// mutation happens under the VM lock.
pub struct CodegenGlobals {
    /// Inline arena: the fast paths
    inline_cb: CodeBlock,

    /// Outlined arena: stubs, exits and other cold code
    outlined_cb: OutlinedCb,

    /// Exit taken when `leave` returns to the interpreter
    leave_exit_code: CodePtr,

    /// Exit taken when a branch stub fails to produce code
    stub_exit_code: CodePtr,

    /// The c_return tracing landing pad; cfunc return patch points route
    /// here after tracing invalidation
    outline_full_cfunc_return_pos: CodePtr,

    /// Inline positions to patch into exits when tracing starts
    global_inval_patches: Vec<CodepagePatch>,

    /// Per-method-serial specialized codegen
    method_codegen_table: HashMap<u64, MethodGenFn>,
}

/// One recorded patch point: an inline position that must be rewritten
/// into a jump to an outlined target
pub struct CodepagePatch {
    pub inline_patch_pos: CodePtr,
    pub outlined_target_pos: CodePtr,
}

/// Private singleton instance
static mut CODEGEN_GLOBALS: Option<CodegenGlobals> = None;

impl CodegenGlobals {
    pub fn init() {
        // exec_mem_size counts MiB
        let mem_size = get_option!(exec_mem_size) * 1024 * 1024;

        #[cfg(not(test))]
        let (mut cb, mut ocb) = {
            use crate::virtualmem::*;
            use std::ptr::NonNull;

            let page_size = unsafe { rb_bbjit_get_page_size() };
            let half_size = mem_size / 2;

            // One reservation, split into the two arenas
            let mem_size_u32: u32 = mem_size.try_into().unwrap();
            let first_half: *mut u8 = unsafe { rb_bbjit_reserve_addr_space(mem_size_u32) };
            let second_half = first_half.wrapping_add(half_size);

            // The protection syscalls need page alignment
            assert_eq!(first_half as usize % page_size.as_usize(), 0);
            assert_eq!(second_half as usize % page_size.as_usize(), 0);

            let inline_mem = VirtualMem::new(
                SystemAllocator {},
                page_size,
                NonNull::new(first_half).unwrap(),
                half_size,
            );
            let outlined_mem = VirtualMem::new(
                SystemAllocator {},
                page_size,
                NonNull::new(second_half).unwrap(),
                half_size,
            );

            (
                CodeBlock::new(inline_mem),
                OutlinedCb::wrap(CodeBlock::new(outlined_mem)),
            )
        };

        // Tests have no VM to get executable pages from
        #[cfg(test)]
        let mut cb = CodeBlock::new_dummy(mem_size / 2);
        #[cfg(test)]
        let mut ocb = OutlinedCb::wrap(CodeBlock::new_dummy(mem_size / 2));

        // The shared exit sequences live at the start of the outlined
        // arena, before anything else gets compiled
        let leave_exit_code = gen_leave_exit(&mut ocb);
        let stub_exit_code = gen_stub_exit(&mut ocb);
        let full_cfunc_return = gen_full_cfunc_return(&mut ocb);

        cb.mark_all_executable();
        ocb.unwrap().mark_all_executable();

        let mut globals = CodegenGlobals {
            inline_cb: cb,
            outlined_cb: ocb,
            leave_exit_code,
            stub_exit_code,
            outline_full_cfunc_return_pos: full_cfunc_return,
            global_inval_patches: Vec::new(),
            method_codegen_table: HashMap::new(),
        };

        globals.reg_method_codegen_fns();

        unsafe { CODEGEN_GLOBALS = Some(globals) };
    }

    /// Register one specialized codegen function. The method is named
    /// rather than referenced so boot order doesn't matter.
    fn reg_method_codegen(&mut self, klass: VALUE, name: &str, gen_fn: MethodGenFn) {
        let id = std::ffi::CString::new(name).unwrap();
        let me = unsafe { rb_method_entry_at(klass, rb_intern(id.as_ptr())) };
        assert!(!me.is_null(), "specialized method must exist");

        let serial = unsafe { get_def_method_serial((*me).def) };
        self.method_codegen_table.insert(serial, gen_fn);
    }

    /// The specialized C methods. Remember the constraints in
    /// [MethodGenFn]'s docs when extending this list.
    #[cfg(not(test))]
    fn reg_method_codegen_fns(&mut self) {
        unsafe {
            self.reg_method_codegen(rb_cBasicObject, "!", jit_rb_obj_not);

            self.reg_method_codegen(rb_cNilClass, "nil?", jit_rb_true);
            self.reg_method_codegen(rb_mKernel, "nil?", jit_rb_false);

            self.reg_method_codegen(rb_cBasicObject, "==", jit_rb_obj_equal);
            self.reg_method_codegen(rb_cBasicObject, "equal?", jit_rb_obj_equal);
            self.reg_method_codegen(rb_mKernel, "eql?", jit_rb_obj_equal);
            self.reg_method_codegen(rb_cModule, "==", jit_rb_obj_equal);
            self.reg_method_codegen(rb_cSymbol, "==", jit_rb_obj_equal);
            self.reg_method_codegen(rb_cSymbol, "===", jit_rb_obj_equal);

            self.reg_method_codegen(rb_cString, "to_s", jit_rb_str_to_s);
            self.reg_method_codegen(rb_cString, "to_str", jit_rb_str_to_s);
            self.reg_method_codegen(rb_cString, "bytesize", jit_rb_str_bytesize);
            self.reg_method_codegen(rb_cString, "<<", jit_rb_str_concat);
            self.reg_method_codegen(rb_cString, "+@", jit_rb_str_uplus);

            self.reg_method_codegen(rb_singleton_class(rb_cThread), "current", jit_thread_s_current);
        }
    }

    /// The dummy arenas can't resolve method entries without a VM
    #[cfg(test)]
    fn reg_method_codegen_fns(&mut self) {}

    pub fn get_instance() -> &'static mut CodegenGlobals {
        unsafe { CODEGEN_GLOBALS.as_mut().unwrap() }
    }

    pub fn get_inline_cb() -> &'static mut CodeBlock {
        &mut CodegenGlobals::get_instance().inline_cb
    }

    pub fn get_outlined_cb() -> &'static mut OutlinedCb {
        &mut CodegenGlobals::get_instance().outlined_cb
    }

    pub fn get_leave_exit_code() -> CodePtr {
        CodegenGlobals::get_instance().leave_exit_code
    }

    pub fn get_stub_exit_code() -> CodePtr {
        CodegenGlobals::get_instance().stub_exit_code
    }

    pub fn get_outline_full_cfunc_return_pos() -> CodePtr {
        CodegenGlobals::get_instance().outline_full_cfunc_return_pos
    }

    pub fn push_global_inval_patch(inline_pos: CodePtr, outlined_pos: CodePtr) {
        CodegenGlobals::get_instance()
            .global_inval_patches
            .push(CodepagePatch {
                inline_patch_pos: inline_pos,
                outlined_target_pos: outlined_pos,
            });
    }

    /// Hand the accumulated patch list to the invalidator
    pub fn take_global_inval_patches() -> Vec<CodepagePatch> {
        std::mem::take(&mut CodegenGlobals::get_instance().global_inval_patches)
    }

    pub fn look_up_codegen_method(method_serial: u64) -> Option<MethodGenFn> {
        CodegenGlobals::get_instance()
            .method_codegen_table
            .get(&method_serial)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_codegen() -> (JITState, Context, CodeBlock, OutlinedCb) {
        let blockid = BlockId {
            iseq: ptr::null(),
            idx: 0,
        };
        let block = Block::new(blockid, &Context::default());

        (
            JITState::new(&block),
            Context::new(),
            CodeBlock::new_dummy(256 * 1024),
            OutlinedCb::wrap(CodeBlock::new_dummy(256 * 1024)),
        )
    }

    /// Point the jit state at a fake instruction whose operands are the
    /// given words
    fn fake_insn(jit: &mut JITState, words: &mut Vec<u64>) {
        jit.pc = words.as_mut_ptr() as *mut VALUE;
    }

    #[test]
    fn test_shared_exit_sequences() {
        let (_, ctx, mut cb, mut ocb) = setup_codegen();

        gen_leave_exit(&mut ocb);
        gen_stub_exit(&mut ocb);
        assert!(ocb.unwrap().get_write_pos() > 0);

        gen_exit(ptr::null_mut(), &ctx, &mut cb);
        assert!(cb.get_write_pos() > 0);
    }

    #[test]
    fn test_side_exit_is_memoized() {
        let (mut jit, ctx, _, mut ocb) = setup_codegen();
        let first = side_exit(&mut jit, &mut ocb, &ctx);
        let pos_after_first = ocb.unwrap().get_write_pos();
        let second = side_exit(&mut jit, &mut ocb, &ctx);

        assert!(first == second);
        assert_eq!(pos_after_first, ocb.unwrap().get_write_pos());
    }

    #[test]
    fn test_gen_check_ints() {
        let (_, _, mut cb, mut ocb) = setup_codegen();
        let exit = ocb.unwrap().get_write_ptr();
        gen_check_ints(&mut cb, exit);
        assert!(cb.get_write_pos() > 0);
    }

    #[test]
    fn test_gen_nop_and_pop() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();

        assert_eq!(gen_nop(&mut jit, &mut ctx, &mut cb, &mut ocb), KeepCompiling);
        assert_eq!(cb.get_write_pos(), 0);
        assert_eq!(ctx.diff(&Context::new()), Some(0));

        let mut ctx = Context::new_with_stack_size(1);
        assert_eq!(gen_pop(&mut jit, &mut ctx, &mut cb, &mut ocb), KeepCompiling);
        assert_eq!(ctx.diff(&Context::new()), Some(0));
        assert_eq!(cb.get_write_pos(), 0);
    }

    #[test]
    fn test_gen_dup_preserves_type() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        ctx.stack_push(Type::Fixnum);

        let status = gen_dup(&mut jit, &mut ctx, &mut cb, &mut ocb);

        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Fixnum);
        assert_eq!(ctx.get_opnd_type(Stack(1)), Type::Fixnum);
        assert!(cb.get_write_pos() > 0);
    }

    #[test]
    fn test_gen_dupn_stack_effect() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        ctx.stack_push(Type::Fixnum);
        ctx.stack_push(Type::Flonum);

        let mut insn = vec![0, 2]; // opcode word, n = 2
        fake_insn(&mut jit, &mut insn);

        let status = gen_dupn(&mut jit, &mut ctx, &mut cb, &mut ocb);

        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_stack_size(), 4);
        assert_eq!(ctx.get_opnd_type(Stack(3)), Type::Fixnum);
        assert_eq!(ctx.get_opnd_type(Stack(2)), Type::Flonum);
        assert_eq!(ctx.get_opnd_type(Stack(1)), Type::Fixnum);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Flonum);
    }

    #[test]
    fn test_gen_swap_swaps_tracking() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        ctx.stack_push(Type::Fixnum);
        ctx.stack_push(Type::Flonum);

        let status = gen_swap(&mut jit, &mut ctx, &mut cb, &mut ocb);

        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Fixnum);
        assert_eq!(ctx.get_opnd_type(Stack(1)), Type::Flonum);
    }

    #[test]
    fn test_gen_setn_copies_tracking() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        ctx.stack_push(Type::Fixnum);
        ctx.stack_push(Type::Flonum);
        ctx.stack_push(Type::String);

        let mut insn = vec![0, 2];
        fake_insn(&mut jit, &mut insn);

        let status = gen_setn(&mut jit, &mut ctx, &mut cb, &mut ocb);

        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_opnd_type(Stack(2)), Type::String);
        assert_eq!(ctx.get_opnd_type(Stack(1)), Type::Flonum);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::String);
        assert!(cb.get_write_pos() > 0);
    }

    #[test]
    fn test_gen_topn_pushes_copy() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        ctx.stack_push(Type::Flonum);
        ctx.stack_push(Type::String);

        let mut insn = vec![0, 1];
        fake_insn(&mut jit, &mut insn);

        let status = gen_topn(&mut jit, &mut ctx, &mut cb, &mut ocb);

        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_opnd_type(Stack(2)), Type::Flonum);
        assert_eq!(ctx.get_opnd_type(Stack(1)), Type::String);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Flonum);
        assert!(cb.get_write_pos() > 0);
    }

    #[test]
    fn test_gen_adjuststack_emits_nothing() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        ctx.stack_push(Type::Flonum);
        ctx.stack_push(Type::String);
        ctx.stack_push(Type::Fixnum);

        let mut insn = vec![0, 2];
        fake_insn(&mut jit, &mut insn);

        let status = gen_adjuststack(&mut jit, &mut ctx, &mut cb, &mut ocb);

        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Flonum);
        assert_eq!(cb.get_write_pos(), 0);
    }

    #[test]
    fn test_putnil_tracks_nil() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        let status = gen_putnil(&mut jit, &mut ctx, &mut cb, &mut ocb);

        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Nil);
        assert!(cb.get_write_pos() > 0);
    }

    #[test]
    fn test_putnil_is_deterministic() {
        // Same request, same bytes: block version deduplication depends
        // on compilation being a pure function of its inputs
        let (mut jit_a, mut ctx_a, mut cb_a, mut ocb_a) = setup_codegen();
        let (mut jit_b, mut ctx_b, mut cb_b, mut ocb_b) = setup_codegen();

        gen_putnil(&mut jit_a, &mut ctx_a, &mut cb_a, &mut ocb_a);
        gen_putnil(&mut jit_b, &mut ctx_b, &mut cb_b, &mut ocb_b);

        assert_eq!(format!("{:x}", cb_a), format!("{:x}", cb_b));
        assert_eq!(ctx_a.diff(&ctx_b), Some(0));
    }

    #[test]
    fn test_putobject_tracks_types() {
        // A boolean literal
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        let mut insn = vec![0, Qtrue.as_u64()];
        fake_insn(&mut jit, &mut insn);
        let status = gen_putobject(&mut jit, &mut ctx, &mut cb, &mut ocb);
        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::True);
        assert!(cb.get_write_pos() > 0);

        // A fixnum literal, 7 tagged as 15
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        let mut insn = vec![0, 15];
        fake_insn(&mut jit, &mut insn);
        let status = gen_putobject(&mut jit, &mut ctx, &mut cb, &mut ocb);
        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Fixnum);
    }

    #[test]
    fn test_int2fix_tracks_fixnum() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        jit.opcode = YARVINSN_putobject_INT2FIX_0_.as_usize();
        let status = gen_putobject_int2fix(&mut jit, &mut ctx, &mut cb, &mut ocb);

        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Fixnum);
    }

    #[test]
    fn test_putself_aliases_self() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        let status = gen_putself(&mut jit, &mut ctx, &mut cb, &mut ocb);

        assert_eq!(status, KeepCompiling);
        assert_eq!(ctx.get_opnd_mapping(Stack(0)).0, SlotMapping::ToSelf);
        assert!(cb.get_write_pos() > 0);
    }

    #[test]
    fn test_guard_two_fixnums_knows_when_to_emit() {
        // Both known: no code
        let (_, mut ctx, mut cb, mut ocb) = setup_codegen();
        ctx.stack_push(Type::Fixnum);
        ctx.stack_push(Type::Fixnum);
        let exit = ocb.unwrap().get_write_ptr();
        guard_two_fixnums(&mut ctx, &mut cb, exit);
        assert_eq!(cb.get_write_pos(), 0);

        // Both unknown: two tag tests, and the types get refined
        let (_, mut ctx, mut cb, mut ocb) = setup_codegen();
        ctx.stack_push(Type::Unknown);
        ctx.stack_push(Type::Unknown);
        let exit = ocb.unwrap().get_write_ptr();
        guard_two_fixnums(&mut ctx, &mut cb, exit);
        assert!(cb.get_write_pos() > 0);
        assert_eq!(ctx.get_opnd_type(Stack(0)), Type::Fixnum);
        assert_eq!(ctx.get_opnd_type(Stack(1)), Type::Fixnum);

        // Known non-fixnum: an unconditional bail
        let (_, mut ctx, mut cb, mut ocb) = setup_codegen();
        ctx.stack_push(Type::String);
        ctx.stack_push(Type::Fixnum);
        let exit = ocb.unwrap().get_write_ptr();
        guard_two_fixnums(&mut ctx, &mut cb, exit);
        assert!(cb.get_write_pos() > 0);
    }

    #[test]
    fn test_gen_leave_requires_one_slot() {
        let (mut jit, mut ctx, mut cb, mut ocb) = setup_codegen();
        ctx.stack_push(Type::Fixnum);
        gen_leave(&mut jit, &mut ctx, &mut cb, &mut ocb);
        assert!(cb.get_write_pos() > 0);
    }
}
