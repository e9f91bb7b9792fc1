use std::ffi::CStr;

// Command-line options
#[derive(Clone, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct Options {
    // Size of the executable memory block to allocate in MiB
    pub exec_mem_size: usize,

    // Calls before an iseq becomes a compilation candidate.
    // A threshold of 1 compiles on the first call.
    pub call_threshold: usize,

    // Generate versions greedily until the limit is hit
    pub greedy_versioning: bool,

    // Turn off type propagation entirely
    pub no_type_prop: bool,

    // Version cap per bytecode position.
    // A cap of 1 degenerates to a single generic version.
    pub max_versions: usize,

    // Capture and print out stats
    pub gen_stats: bool,

    /// Print each instruction as it gets compiled
    pub dump_insns: bool,

    /// Check tracked types against live values (debug builds)
    pub verify_ctx: bool,

    /// Whether to start the JIT paused; it can be resumed later
    pub pause: bool,
}

// Defaults, overridden by --bbjit-* flags
pub static mut OPTIONS: Options = Options {
    exec_mem_size: 256,
    call_threshold: 10,
    greedy_versioning: false,
    no_type_prop: false,
    max_versions: 4,
    gen_stats: false,
    dump_insns: false,
    verify_ctx: false,
    pause: false,
};

/// Read one option field by name
macro_rules! get_option {
    // Options are written once during boot, before any code that
    // reads them can run
    ($option_name:ident) => {
        unsafe { $crate::options::OPTIONS.$option_name }
    };
}
pub(crate) use get_option;

/// Expected to receive what comes after the third dash in "--bbjit-*".
/// Empty string means user passed only "--bbjit". C code rejects when
/// they pass exact "--bbjit-".
pub fn parse_option(str_ptr: *const std::os::raw::c_char) -> Option<()> {
    let c_str: &CStr = unsafe { CStr::from_ptr(str_ptr) };
    let opt_str: &str = c_str.to_str().ok()?;

    // Split at the first '='. Bare flags have no assignment
    let parts = opt_str.split_once('=');
    let (opt_name, opt_val) = match parts {
        Some((before_eq, after_eq)) => (before_eq, after_eq),
        None => (opt_str, ""),
    };

    // Dispatch on the name, then parse the value
    match (opt_name, opt_val) {
        ("", "") => (), // Simply --bbjit

        ("exec-mem-size", _) => match opt_val.parse::<usize>() {
            Ok(n) => {
                if n == 0 || n > 2 * 1024 {
                    return None;
                }
                unsafe { OPTIONS.exec_mem_size = n }
            }
            Err(_) => {
                return None;
            }
        },

        ("call-threshold", _) => match opt_val.parse() {
            Ok(n) => unsafe { OPTIONS.call_threshold = n },
            Err(_) => {
                return None;
            }
        },

        ("max-versions", _) => match opt_val.parse() {
            Ok(n) => unsafe { OPTIONS.max_versions = n },
            Err(_) => {
                return None;
            }
        },

        ("pause", "") => unsafe {
            OPTIONS.pause = true;
        },

        ("greedy-versioning", "") => unsafe { OPTIONS.greedy_versioning = true },
        ("no-type-prop", "") => unsafe { OPTIONS.no_type_prop = true },
        ("stats", "") => unsafe { OPTIONS.gen_stats = true },
        ("dump-insns", "") => unsafe { OPTIONS.dump_insns = true },
        ("verify-ctx", "") => unsafe { OPTIONS.verify_ctx = true },

        // Unknown option
        _ => {
            return None;
        }
    }

    // Parsed
    return Some(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn parse(str: &str) -> Option<()> {
        let c_str = CString::new(str).unwrap();
        parse_option(c_str.as_ptr())
    }

    #[test]
    fn test_parse_option() {
        assert!(parse("").is_some());
        assert!(parse("call-threshold=42").is_some());
        assert_eq!(get_option!(call_threshold), 42);

        assert!(parse("exec-mem-size=128").is_some());
        assert_eq!(get_option!(exec_mem_size), 128);

        // Out of range or malformed values are rejected
        assert!(parse("exec-mem-size=0").is_none());
        assert!(parse("exec-mem-size=9999999").is_none());
        assert!(parse("call-threshold=banana").is_none());
        assert!(parse("no-such-option").is_none());
    }
}
