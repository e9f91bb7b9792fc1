//! Small shared helpers with no better home.

/// Infallible, checked-by-construction casts to [usize], spelled
/// `.as_usize()`. Bare `as usize` would silently truncate if we ever
/// target a platform with a narrow usize; spelled this way the casts are
/// easy to audit.
pub(crate) trait IntoUsize {
    fn as_usize(self) -> usize;
}

#[cfg(target_pointer_width = "64")]
impl IntoUsize for u64 {
    fn as_usize(self) -> usize {
        self as usize
    }
}

#[cfg(target_pointer_width = "64")]
impl IntoUsize for u32 {
    fn as_usize(self) -> usize {
        self as usize
    }
}

impl IntoUsize for u16 {
    fn as_usize(self) -> usize {
        self.into()
    }
}

impl IntoUsize for u8 {
    fn as_usize(self) -> usize {
        self.into()
    }
}

/// Declare a function that generated code can call directly: the machine
/// code we emit uses the SysV convention regardless of how the crate
/// itself is compiled.
#[cfg(target_arch = "x86_64")]
macro_rules! c_callable {
    ($(#[$m:meta])* fn $f:ident $args:tt -> $ret:ty $body:block) => {
        $(#[$m])* extern "sysv64" fn $f $args -> $ret $body
    };
    ($(#[$m:meta])* fn $f:ident $args:tt $body:block) => {
        $(#[$m])* extern "sysv64" fn $f $args $body
    };
}
pub(crate) use c_callable;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usize_casts_preserve_extremes() {
        assert_eq!(u64::MIN.as_usize(), usize::try_from(u64::MIN).unwrap());
        assert_eq!(u64::MAX.as_usize(), usize::try_from(u64::MAX).unwrap());
        assert_eq!(u32::MAX.as_usize(), usize::try_from(u32::MAX).unwrap());
        assert_eq!(u16::MAX.as_usize(), usize::from(u16::MAX));
        assert_eq!(u8::MAX.as_usize(), usize::from(u8::MAX));
    }
}
