//! Runtime counters. Collected when the crate is built with the `stats`
//! feature and the host passes --bbjit-stats.

#![allow(dead_code)] // Counters are only read with the stats feature

use crate::bbjit::bbjit_enabled_p;
use crate::cruby::*;
use crate::options::*;

/// Declare the [Counter] enum along with its name table. Counters index
/// directly into a flat array of u64 slots, so generated code can bump one
/// with a single locked add on its slot address.
macro_rules! counters {
    ($($name:ident,)+) => {
        #[allow(non_camel_case_types)]
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        #[repr(usize)]
        pub enum Counter { $($name),+ }

        /// Counter names, indexed by discriminant
        pub const COUNTER_NAMES: &[&str] = &[$(stringify!($name)),+];
    }
}

counters! {
    exec_instruction,

    send_keywords,
    send_kw_splat,
    send_args_splat,
    send_block_arg,
    send_ivar_set_method,
    send_zsuper_method,
    send_undef_method,
    send_optimized_method_send,
    send_optimized_method_call,
    send_optimized_method_block_call,
    send_missing_method,
    send_bmethod,
    send_refined_method,
    send_cfunc_ruby_array_varg,
    send_cfunc_argc_mismatch,
    send_cfunc_toomany_args,
    send_cfunc_tracing,
    send_iseq_tailcall,
    send_iseq_arity_error,
    send_iseq_complex_callee,
    send_not_implemented_method,
    send_getter_arity,
    send_se_cf_overflow,
    send_se_protected_check_failed,

    traced_cfunc_return,

    invokesuper_me_changed,
    invokesuper_block,

    leave_se_interrupt,
    leave_interp_return,
    leave_start_pc_non_zero,

    getivar_idx_out_of_range,
    getivar_megamorphic,

    oaref_argc_not_one,
    oaref_arg_not_fixnum,

    opt_getinlinecache_miss,

    compiled_iseq_count,
    compiled_block_count,
    compilation_failure,

    exit_from_branch_stub,

    invalidation_count,
    invalidate_method_lookup,
    invalidate_bop_redefined,
    invalidate_ractor_spawn,
    invalidate_constant_state_bump,
    invalidate_constant_ic_fill,
    invalidate_tracing,

    expandarray_splat,
    expandarray_postarg,
    expandarray_not_array,
    expandarray_rhs_too_small,

    gbpp_block_param_modified,
    gbpp_block_handler_not_iseq,
}

/// One slot per counter
static mut COUNTERS: [u64; COUNTER_NAMES.len()] = [0; COUNTER_NAMES.len()];

/// Per-opcode tallies of side exits taken
static mut EXIT_OP_COUNT: [u64; VM_INSTRUCTION_SIZE as usize] = [0; VM_INSTRUCTION_SIZE as usize];

/// Bump a counter from Rust code
pub fn incr_counter(counter: Counter) {
    // Safe enough: all Rust-side increments happen under the VM lock
    unsafe { COUNTERS[counter as usize] += 1 };
}

/// Address of a counter's slot, for generated code to add into.
/// Generated increments use a locked add, which keeps them ractor-safe.
pub fn counter_ptr(counter: Counter) -> *mut u64 {
    unsafe { std::ptr::addr_of_mut!(COUNTERS[counter as usize]) }
}

/// Called from side-exit code to record which opcode was exited at.
/// The sum over the table is the total number of side exits taken.
#[no_mangle]
pub extern "C" fn rb_bbjit_count_side_exit_op(exit_pc: *const VALUE) -> *const VALUE {
    #[cfg(not(test))]
    unsafe {
        let insn = rb_vm_insn_addr2opcode((*exit_pc).as_ptr());
        EXIT_OP_COUNT[insn as usize] += 1;
    }

    // The generated caller clobbers its scratch register with our return
    // value, so hand the PC back.
    exit_pc
}

/// Called by the host at process exit when --bbjit-stats was given
#[no_mangle]
pub extern "C" fn rb_bbjit_print_stats() {
    if !bbjit_enabled_p() || !get_option!(gen_stats) {
        return;
    }

    eprintln!("***bbjit: runtime counters***");
    for (idx, &name) in COUNTER_NAMES.iter().enumerate() {
        let val = unsafe { COUNTERS[idx] };
        if val > 0 {
            eprintln!("{:<34} {:>12}", name, val);
        }
    }

    // The opcodes we most often exit at say where specialization fails
    let mut exits: Vec<(usize, u64)> = Vec::new();
    for opcode in 0..(VM_INSTRUCTION_SIZE as usize) {
        let count = unsafe { EXIT_OP_COUNT[opcode] };
        if count > 0 {
            exits.push((opcode, count));
        }
    }
    exits.sort_by_key(|&(_, count)| std::cmp::Reverse(count));

    if !exits.is_empty() {
        eprintln!("***bbjit: most frequent side exits***");
        for &(opcode, count) in exits.iter().take(20) {
            eprintln!("{:<34} {:>12}", insn_name(opcode), count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_slots_line_up_with_names() {
        assert_eq!(Counter::exec_instruction as usize, 0);
        assert_eq!(
            COUNTER_NAMES[Counter::compilation_failure as usize],
            "compilation_failure"
        );

        incr_counter(Counter::compilation_failure);
        let slot = counter_ptr(Counter::compilation_failure);
        assert!(unsafe { *slot } >= 1);
    }
}
