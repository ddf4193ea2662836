//! Nullable, comparable address of a byte inside an arena.
//!
//! A [`Pointer`] never owns memory; the context that reserved the range it
//! points into does. Its all-zero bit pattern is the null pointer, which is
//! what lets every container handle default to a valid empty state.

use std::fmt;
use std::ptr;

/// Address of a byte inside an [`Arena`](crate::Arena), or null.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pointer(*mut u8);

// SAFETY: A Pointer is an address; reading or writing through it is unsafe
// and the caller is responsible for synchronising access to the bytes.
unsafe impl Send for Pointer {}
unsafe impl Sync for Pointer {}

impl Default for Pointer {
    fn default() -> Self {
        Self::null()
    }
}

impl Pointer {
    /// The null pointer.
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Pointer(ptr::null_mut())
    }

    #[inline]
    pub(crate) const fn from_raw(raw: *mut u8) -> Self {
        Pointer(raw)
    }

    /// Returns the raw address.
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0
    }

    /// Returns the numeric address.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.addr()
    }

    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    #[inline]
    #[must_use]
    pub fn is_not_null(self) -> bool {
        !self.0.is_null()
    }

    /// Advances the pointer by `bytes`.
    ///
    /// Computed with wrapping arithmetic; the result is only meaningful
    /// while it stays inside the range the pointer came from.
    #[inline]
    #[must_use]
    pub fn byte_add(self, bytes: usize) -> Self {
        Pointer(self.0.wrapping_add(bytes))
    }

    /// Advances the pointer by `count` elements of `T`.
    #[inline]
    #[must_use]
    pub fn element_add<T>(self, count: usize) -> Self {
        self.byte_add(count * size_of::<T>())
    }

    /// Number of bytes from `origin` to `self`.
    #[inline]
    #[must_use]
    pub fn offset_from(self, origin: Pointer) -> usize {
        self.addr().wrapping_sub(origin.addr())
    }

    /// Reinterprets the pointer as `*mut T`.
    #[inline]
    #[must_use]
    pub fn cast<T>(self) -> *mut T {
        self.0.cast::<T>()
    }

    /// Reads a `T` at this address.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, aligned for `T` and point into a live
    /// reservation holding an initialised `T`.
    #[inline]
    pub unsafe fn read<T: Copy>(self) -> T {
        unsafe { ptr::read(self.cast::<T>()) }
    }

    /// Writes a `T` at this address.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, aligned for `T` and point into a live
    /// reservation with room for a `T`, with no outstanding borrow of it.
    #[inline]
    pub unsafe fn write<T: Copy>(self, value: T) {
        unsafe { ptr::write(self.cast::<T>(), value) }
    }

    /// Borrows the `T` at this address.
    ///
    /// # Safety
    ///
    /// As for [`Pointer::read`], and the reservation must outlive `'a`
    /// without being written through another path.
    #[inline]
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        unsafe { &*self.cast::<T>() }
    }

    /// Mutably borrows the `T` at this address.
    ///
    /// # Safety
    ///
    /// As for [`Pointer::as_ref`], and no other reference to the value may
    /// exist for `'a`.
    #[inline]
    pub unsafe fn as_mut<'a, T>(self) -> &'a mut T {
        unsafe { &mut *self.cast::<T>() }
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Pointer(null)")
        } else {
            write!(f, "Pointer({:#x})", self.addr())
        }
    }
}
