//! The assumption registry. Blocks register the speculative facts their
//! code relies on; the host calls in here the moment one of those facts
//! stops holding, and every dependent block gets invalidated before user
//! code can observe the stale assumption.

use crate::asm::OutlinedCb;
use crate::bbjit::bbjit_enabled_p;
use crate::codegen::*;
use crate::core::*;
use crate::cruby::*;
use crate::stats::*;

use std::collections::{HashMap, HashSet};
use std::mem;

/// A (class redefinition flag, operator) pair naming one basic operator
type BopKey = (RedefinitionFlag, ruby_basic_operators);

/// Reverse indexes from each assumption subject to the blocks that depend
/// on it. Every entry means: when this subject changes, those blocks die.
pub struct Invariants {
    /// Blocks keyed by the method entry whose lookup they baked in.
    /// Method redefinition, inclusion changes and entry invalidation all
    /// funnel into [rb_bbjit_cme_invalidate].
    stable_cmes: HashMap<*const rb_callable_method_entry_t, HashSet<BlockRef>>,

    /// Blocks keyed by the basic operator they assume untouched, eg:
    /// Integer#+ for the fixnum fast paths.
    unredefined_bops: HashMap<BopKey, HashSet<BlockRef>>,

    /// The operators each block assumed, so a dying block can be scrubbed
    /// out of [Self::unredefined_bops] without a full scan
    bops_by_block: HashMap<BlockRef, HashSet<BopKey>>,

    /// Blocks that assume no second ractor exists yet. Constant reads
    /// compiled in single-ractor mode depend on this.
    single_ractor_blocks: HashSet<BlockRef>,

    /// Blocks that baked in a constant's value. One set for all constants:
    /// any constant write invalidates them all.
    stable_constant_blocks: HashSet<BlockRef>,
}

/// Private singleton; mutated only under the VM lock
static mut INVARIANTS: Option<Invariants> = None;

impl Invariants {
    pub fn init() {
        unsafe {
            INVARIANTS = Some(Invariants {
                stable_cmes: HashMap::new(),
                unredefined_bops: HashMap::new(),
                bops_by_block: HashMap::new(),
                single_ractor_blocks: HashSet::new(),
                stable_constant_blocks: HashSet::new(),
            });
        }
    }

    pub fn get_instance() -> &'static mut Invariants {
        unsafe { INVARIANTS.as_mut().unwrap() }
    }
}

/// Record that the block being compiled only works while `bop` on the
/// classes in `klass` stays at its default definition. Returns false (and
/// registers nothing) when the operator is already redefined, in which
/// case the caller must not specialize.
pub fn assume_bop_not_redefined(
    jit: &mut JITState,
    ocb: &mut OutlinedCb,
    klass: RedefinitionFlag,
    bop: ruby_basic_operators,
) -> bool {
    if !unsafe { BASIC_OP_UNREDEFINED_P(bop, klass) } {
        return false;
    }

    // Anything that can be invalidated needs an entry exit to patch to
    jit_ensure_block_entry_exit(jit, ocb);

    let invariants = Invariants::get_instance();
    invariants
        .unredefined_bops
        .entry((klass, bop))
        .or_default()
        .insert(jit.get_block());
    invariants
        .bops_by_block
        .entry(jit.get_block())
        .or_default()
        .insert((klass, bop));

    true
}

/// Record that the block being compiled dispatches through
/// `rb_callable_method_entry(receiver_klass, mid) == cme`, and dies when
/// that stops being true or the entry itself is invalidated.
pub fn assume_method_lookup_stable(
    jit: &mut JITState,
    ocb: &mut OutlinedCb,
    receiver_klass: VALUE,
    callee_cme: *const rb_callable_method_entry_t,
) {
    jit_ensure_block_entry_exit(jit, ocb);

    // The block remembers both halves so the registry entry can be
    // removed when the block dies first
    let block = jit.get_block();
    block
        .borrow_mut()
        .add_cme_dependency(receiver_klass, callee_cme);

    Invariants::get_instance()
        .stable_cmes
        .entry(callee_cme)
        .or_default()
        .insert(block);
}

/// Record that the block being compiled is only sound while a single
/// ractor exists. Returns false when that ship has already sailed.
#[must_use]
pub fn assume_single_ractor_mode(jit: &mut JITState, ocb: &mut OutlinedCb) -> bool {
    if unsafe { rb_bbjit_multi_ractor_p() } {
        return false;
    }

    jit_ensure_block_entry_exit(jit, ocb);
    Invariants::get_instance()
        .single_ractor_blocks
        .insert(jit.get_block());
    true
}

/// Record that the block being compiled baked a constant's value in
pub fn assume_stable_constant_state(jit: &mut JITState, ocb: &mut OutlinedCb) {
    jit_ensure_block_entry_exit(jit, ocb);
    Invariants::get_instance()
        .stable_constant_blocks
        .insert(jit.get_block());
}

/// Host callback: a basic operator was redefined on one of the core
/// classes. Tracking is per (class, operator), so only the blocks that
/// leaned on that exact operator go.
#[no_mangle]
pub extern "C" fn rb_bbjit_bop_redefined(klass: RedefinitionFlag, bop: ruby_basic_operators) {
    if !bbjit_enabled_p() {
        return;
    }

    with_vm_lock(src_loc!(), || {
        let dependents = Invariants::get_instance()
            .unredefined_bops
            .remove(&(klass, bop));

        for block in dependents.iter().flatten() {
            invalidate_block_version(block);
            incr_counter(Counter::invalidate_bop_redefined);
        }
    });
}

/// Host callback: a method entry became invalid (redefinition, removal,
/// include/prepend/refinement changes all land here)
#[no_mangle]
pub extern "C" fn rb_bbjit_cme_invalidate(callee_cme: *const rb_callable_method_entry_t) {
    if !bbjit_enabled_p() {
        return;
    }

    with_vm_lock(src_loc!(), || {
        let dependents = Invariants::get_instance().stable_cmes.remove(&callee_cme);

        for block in dependents.iter().flatten() {
            invalidate_block_version(block);
            incr_counter(Counter::invalidate_method_lookup);
        }
    });
}

/// Host callback: a second ractor is about to spawn
#[no_mangle]
pub extern "C" fn rb_bbjit_before_ractor_spawn() {
    if !bbjit_enabled_p() {
        return;
    }

    with_vm_lock(src_loc!(), || {
        let dependents = mem::take(&mut Invariants::get_instance().single_ractor_blocks);

        for block in &dependents {
            invalidate_block_version(block);
            incr_counter(Counter::invalidate_ractor_spawn);
        }
    });
}

/// Host callback: some constant was assigned, or the constant cache
/// generation was bumped. No per-name tracking; everything constant-
/// dependent goes.
#[no_mangle]
pub extern "C" fn rb_bbjit_constant_state_changed() {
    if !bbjit_enabled_p() {
        return;
    }

    with_vm_lock(src_loc!(), || {
        let dependents = mem::take(&mut Invariants::get_instance().stable_constant_blocks);

        for block in &dependents {
            invalidate_block_version(block);
            incr_counter(Counter::invalidate_constant_state_bump);
        }
    });
}

/// Host callback from opt_setinlinecache: a constant cache just got
/// filled. The versions compiled for the matching opt_getinlinecache
/// either side exit (empty cache) or re-check a now-repointed cache, so
/// drop them and let recompilation pick the value up.
#[no_mangle]
pub extern "C" fn rb_bbjit_constant_ic_update(iseq: *const rb_iseq_t, ic: IC) {
    if !bbjit_enabled_p() {
        return;
    }

    // Caches that couldn't have been compiled need no invalidation.
    // Paired with the constant-cache codegen path.
    if !unsafe { (*(*ic).entry).ic_cref }.is_null() || unsafe { rb_bbjit_multi_ractor_p() } {
        return;
    }

    with_vm_lock(src_loc!(), || {
        // The cache knows which instruction reads through it
        let insn_idx = unsafe { (*ic).get_insn_idx };
        assert!(insn_idx < unsafe { get_iseq_encoded_size(iseq) });

        for block in take_version_list(BlockId {
            iseq,
            idx: insn_idx,
        }) {
            invalidate_block_version(&block);
            incr_counter(Counter::invalidate_constant_ic_fill);
        }
    });
}

/// GC hook: keep the method entries used as registry keys alive.
/// The table hashes cme pointers by identity, so letting the keys move
/// would require a rehash at a very awkward time; marking them pinned
/// sidesteps that.
#[no_mangle]
pub extern "C" fn rb_bbjit_root_mark() {
    let invariants = Invariants::get_instance();

    for cme in invariants.stable_cmes.keys() {
        let cme: VALUE = (*cme).into();
        unsafe { rb_gc_mark(cme) };
    }
}

/// Drop a set-valued map entry once the set goes empty, keeping the
/// registry from accumulating dead keys
fn forget_if_empty<K: std::hash::Hash + Eq + Copy>(
    map: &mut HashMap<K, HashSet<BlockRef>>,
    key: K,
    block: &BlockRef,
) {
    if let Some(set) = map.get_mut(&key) {
        set.remove(block);
        if set.is_empty() {
            map.remove(&key);
        }
    }
}

/// Scrub a dying block out of every registry table, so the subject-side
/// callbacks above can never see (or double-invalidate) it again
pub fn block_assumptions_free(blockref: &BlockRef) {
    let invariants = Invariants::get_instance();

    // The block lists its own method-entry dependencies
    for dep in blockref.borrow().iter_cme_deps() {
        forget_if_empty(&mut invariants.stable_cmes, dep.callee_cme, blockref);
    }

    // And its reverse index lists its operator assumptions
    if let Some(bops) = invariants.bops_by_block.remove(blockref) {
        for bop in bops {
            forget_if_empty(&mut invariants.unredefined_bops, bop, blockref);
        }
    }

    invariants.single_ractor_blocks.remove(blockref);
    invariants.stable_constant_blocks.remove(blockref);
}

/// Host callback: a c_call or c_return tracepoint was just enabled, so
/// every compiled block is now unable to fire the events it should.
/// Nothing can be freed (other ractors may be executing inside any of
/// this code), so instead:
///
/// 1. Under the lock and barrier, unlink every block version so nothing
///    new jumps in.
/// 2. Rewrite every recorded boundary patch point into a jump to its
///    outlined exit. Other ractors are parked in C calls, so each one
///    resumes, finishes its current VM instruction, and falls out at the
///    next boundary, where the interpreter fires any events itself.
/// 3. Cfunc return patch points route through the full_cfunc_return
///    landing pad instead, because a plain boundary exit would be too
///    late to fire that call's own c_return event.
/// 4. Raise the arena's frozen watermark over everything patched; the
///    region is executing unsynchronized and can never change again.
#[no_mangle]
pub extern "C" fn rb_bbjit_tracing_invalidate_all() {
    if !bbjit_enabled_p() {
        return;
    }

    with_vm_lock(src_loc!(), || {
        // Step 1: no block version remains a valid jump target
        for_each_iseq(|iseq| {
            let payload = get_iseq_payload(iseq);
            for blockref in payload.take_all_blocks() {
                // Scrubbing the registry stops later double invalidation;
                // the block's storage itself leaks by design
                block_assumptions_free(&blockref);
            }

            unsafe { rb_iseq_reset_jit_func(iseq) };
        });

        // Steps 2 and 3: apply the recorded patches in address order,
        // checking that no two patches overlap
        let cb = CodegenGlobals::get_inline_cb();
        let old_pos = cb.get_write_pos();

        let mut patches = CodegenGlobals::take_global_inval_patches();
        patches.sort_by_cached_key(|patch| patch.inline_patch_pos.raw_ptr());

        let mut prev_end = std::ptr::null();
        for patch in &patches {
            assert!(
                prev_end <= patch.inline_patch_pos.raw_ptr(),
                "patches should not overlap",
            );

            cb.set_write_ptr(patch.inline_patch_pos);
            cb.jmp_ptr(patch.outlined_target_pos);
            prev_end = cb.get_write_ptr().raw_ptr();
        }
        cb.set_pos(old_pos);

        // Step 4: freeze everything written so far. Code before the
        // watermark may be mid-execution on another ractor (one could be
        // sleeping in a branch stub right now), so from here on we only
        // ever wait for it to exit.
        cb.set_frozen_bytes(old_pos);

        CodegenGlobals::get_outlined_cb().unwrap().mark_all_executable();
        cb.mark_all_executable();

        incr_counter(Counter::invalidate_tracing);
    });
}
