use crate::codegen::*;
use crate::core::*;
use crate::cruby::*;
use crate::invariants::*;
use crate::options::*;

use std::os::raw;
use std::sync::atomic::{AtomicBool, Ordering};

/// For tracking whether the user enabled the JIT through command line arguments
/// or environment variables. AtomicBool to avoid `unsafe`. On x86 it compiles
/// to simple movs.
/// Orderings per <https://doc.rust-lang.org/std/sync/atomic/enum.Ordering.html>
/// See [rb_bbjit_enabled_p]
static BBJIT_ENABLED: AtomicBool = AtomicBool::new(false);

/// When false, no new iseqs are compiled; existing branch stubs still get serviced.
static COMPILE_NEW_ISEQS: AtomicBool = AtomicBool::new(false);

/// Handle one command-line option string.
/// This is called from the host's option handling code.
#[no_mangle]
pub extern "C" fn rb_bbjit_parse_option(str_ptr: *const raw::c_char) -> bool {
    return parse_option(str_ptr).is_some();
}

/// Is the JIT on? The interpreter uses this function to decide whether to
/// increment ISEQ call counters. See jit_exec().
/// On the interpreter's per-call hot path, so a single relaxed load.
#[no_mangle]
pub extern "C" fn rb_bbjit_enabled_p() -> raw::c_int {
    // May someday run inside signal handlers; keep it signal-safe(7).
    BBJIT_ENABLED.load(Ordering::Acquire).into()
}

#[no_mangle]
pub extern "C" fn rb_bbjit_compile_new_iseqs() -> bool {
    COMPILE_NEW_ISEQS.load(Ordering::Acquire).into()
}

/// Like rb_bbjit_enabled_p, but for Rust code.
pub fn bbjit_enabled_p() -> bool {
    BBJIT_ENABLED.load(Ordering::Acquire)
}

/// Whether an iseq that crossed the call threshold should compile now
#[no_mangle]
pub extern "C" fn rb_bbjit_threshold_hit(_iseq: IseqPtr, total_calls: u64) -> bool {
    let call_threshold = get_option!(call_threshold) as u64;
    return total_calls == call_threshold;
}

/// Called once from the host during boot
#[no_mangle]
pub extern "C" fn rb_bbjit_init_rust() {
    // TODO: assert that option parsing finished before this point;
    // initialized by the host

    // Unwinding into C frames is UB, so panics must stop at this
    // boundary (https://doc.rust-lang.org/nomicon/exception-safety.html).
    let result = std::panic::catch_unwind(|| {
        Invariants::init();
        CodegenGlobals::init();

        rb_bug_panic_hook();

        // JIT enabled and initialized successfully
        BBJIT_ENABLED.store(true, Ordering::Release);

        COMPILE_NEW_ISEQS.store(!get_option!(pause), Ordering::Release);
    });

    if let Err(_) = result {
        println!("bbjit: rb_bbjit_init_rust() panicked. Aborting.");
        std::process::abort();
    }
}

/// Every panic currently aborts the process.
/// So crash reports from the wild are actionable without
/// people to set RUST_BACKTRACE=1, register a panic hook that crashes using
/// the host's rb_bug(). rb_bug() might not be as good at printing a call
/// trace as Rust's stdlib, but it dumps some other info that might be
/// relevant.
///
/// If panic=unwind handling ever becomes worthwhile this can change;
/// until then an immediate loud abort gives the best bug reports.
fn rb_bug_panic_hook() {
    use std::env;
    use std::io::{stderr, Write};
    use std::panic;

    // Installed early in boot, so the previous hook is the default one.
    let previous_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        // eprintln could itself panic; write directly.
        let _ = stderr().write_all(b"ruby: bbjit has panicked. More info to follow...\n");

        // Force the backtrace on.
        env::set_var("RUST_BACKTRACE", "1");
        previous_hook(panic_info);

        unsafe {
            rb_bug(b"bbjit panicked\0".as_ref().as_ptr() as *const raw::c_char);
        }
    }));
}

/// Host entry point to compile an iseq.
/// The C caller wraps this in RB_VM_LOCK_ENTER() and rb_vm_barrier().
#[no_mangle]
pub extern "C" fn rb_bbjit_iseq_gen_entry_point(iseq: IseqPtr, ec: EcPtr) -> *const u8 {
    // Reject ISEQs with very large temp stacks. We cannot encode stack
    // offsets that reach outside of what an i16 sp_offset can address.
    let stack_max = unsafe { get_iseq_body_stack_max(iseq) };
    if stack_max >= i16::MAX as u32 {
        return std::ptr::null();
    }

    let maybe_code_ptr = gen_entry_point(iseq, ec);

    match maybe_code_ptr {
        Some(ptr) => ptr.raw_ptr(),
        None => std::ptr::null(),
    }
}

#[no_mangle]
pub extern "C" fn rb_bbjit_resume(_ec: EcPtr, _ruby_self: VALUE) -> VALUE {
    if bbjit_enabled_p() {
        COMPILE_NEW_ISEQS.store(true, Ordering::Release);
    }

    Qnil
}

/// Pretend the executable arenas are exhausted
#[no_mangle]
pub extern "C" fn rb_bbjit_simulate_oom_bang(_ec: EcPtr, _ruby_self: VALUE) -> VALUE {
    // If the JIT is not enabled, do nothing
    if !bbjit_enabled_p() {
        return Qnil;
    }

    // Debug builds only; not a production knob
    if cfg!(debug_assertions) {
        let cb = CodegenGlobals::get_inline_cb();
        let ocb = CodegenGlobals::get_outlined_cb().unwrap();
        cb.set_pos(cb.get_mem_size());
        ocb.set_pos(ocb.get_mem_size());
    }

    return Qnil;
}
