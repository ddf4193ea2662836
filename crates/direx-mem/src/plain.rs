//! Element types that may live inside arena memory.

use crate::pointer::Pointer;

/// A type that can be stored in arena memory and moved around bitwise.
///
/// Containers copy elements with `memcpy`, hand out copies by value and
/// zero-fill fresh storage, so an implementor must be `Copy`, must not own
/// heap memory outside the arena, and must treat the all-zero bit pattern as
/// a valid value (its "zero value"). Arena handles are `Plain` too, lifetime
/// and all, which is what lets arrays and maps nest.
///
/// # Safety
///
/// Implementing this for a type whose all-zero bit pattern is not a valid
/// value (references, `NonZero*`, most enums) is undefined behaviour.
pub unsafe trait Plain: Copy {}

macro_rules! impl_plain {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: primitive with a valid all-zero representation.
            unsafe impl Plain for $ty {}
        )*
    };
}

impl_plain!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, (),
);

// SAFETY: the null pointer is all zeroes.
unsafe impl Plain for Pointer {}

// SAFETY: arrays and pairs of zero-valid values are zero-valid.
unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}
unsafe impl<A: Plain, B: Plain> Plain for (A, B) {}

/// Returns the zero value of `T`.
#[must_use]
pub fn zeroed<T: Plain>() -> T {
    // SAFETY: Plain guarantees the all-zero bit pattern is a valid T.
    unsafe { std::mem::zeroed() }
}
