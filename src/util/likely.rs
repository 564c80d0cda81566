//! Branch prediction hints on stable Rust.

#[cold]
const fn cold_path() {}

/// Hint that `b` is almost always `true`.
#[inline(always)]
pub(crate) const fn likely(b: bool) -> bool {
    if !b {
        cold_path();
    }
    b
}

/// Hint that `b` is almost always `false`.
#[inline(always)]
pub(crate) const fn unlikely(b: bool) -> bool {
    if b {
        cold_path();
    }
    b
}
