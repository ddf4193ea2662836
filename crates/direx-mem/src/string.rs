//! Immutable, reference-counted strings in arena memory.
//!
//! An [`RcString`] is `{ ptr, length, holder }`: a byte range inside a
//! *holder*, a `Slice<u8>` whose first [`COUNTER_SIZE`] bytes carry an atomic
//! reference count. Several strings may share one holder (see
//! [`StringFactory`](crate::StringFactory)); the holder is freed when the last
//! of them is. The empty string has a null holder and is never counted.
//!
//! Strings are `Copy` like every other arena handle, but each copy obtained
//! from [`RcString::from_bytes`], the factory or [`RcString::share`] owns one
//! reference and must be freed exactly once. The bytes never change while any
//! reference is held, so borrowing them ([`RcString::as_bytes`]) is safe; a
//! string carries its context's lifetime and cannot outlive its arena.

use crate::config;
use crate::context::MemoryContext;
use crate::error::{Error, Result};
use crate::map::KeyHash;
use crate::plain::Plain;
use crate::pointer::Pointer;
use crate::slice::Slice;
use direx_log::error;
use std::fmt;
use std::str::Utf8Error;
use std::sync::atomic::{AtomicI32, Ordering};

/// Bytes at the start of a holder reserved for its reference count.
pub const COUNTER_SIZE: usize = 8;

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV hash of `bytes`, multiplying before xoring each byte.
#[must_use]
pub fn fnv_hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, &b| hash.wrapping_mul(FNV_PRIME) ^ u32::from(b))
}

/// Reference counter at the base of a non-null holder.
///
/// # Safety
///
/// `holder` must be a live holder, its data at least [`COUNTER_SIZE`] bytes.
unsafe fn counter<'a>(holder: Slice<'_, u8>) -> &'a AtomicI32 {
    // SAFETY: holder data is 16-byte aligned and only ever touched atomically.
    unsafe { AtomicI32::from_ptr(holder.base().cast::<i32>()) }
}

/// Allocates a holder with `capacity` usable bytes after the counter, which
/// starts at 1.
pub(crate) fn new_holder<'a, C>(capacity: usize, ctx: &C) -> Result<Slice<'a, u8>>
where
    C: MemoryContext<'a> + ?Sized,
{
    let holder = Slice::<u8>::with_length(ctx, COUNTER_SIZE + capacity)?;
    // SAFETY: freshly allocated holder with room for the counter.
    unsafe { counter(holder) }.store(1, Ordering::Release);
    Ok(holder)
}

/// Adds a reference to a non-null holder.
pub(crate) fn retain_holder(holder: Slice<'_, u8>) {
    // SAFETY: callers own a reference, so the holder is live.
    unsafe { counter(holder) }.fetch_add(1, Ordering::AcqRel);
}

/// Drops one reference to `holder`, freeing it through `ctx` at zero.
pub(crate) fn release_holder<'a, C>(holder: Slice<'a, u8>, ctx: &C)
where
    C: MemoryContext<'a> + ?Sized,
{
    if holder.is_null() {
        return;
    }
    // SAFETY: callers own a reference, so the holder is live.
    let count = unsafe { counter(holder) }.fetch_sub(1, Ordering::AcqRel) - 1;
    if count < 0 && config::checked() {
        let err = Error::DoubleFree { addr: holder.base().addr() };
        error!("string holder count dropped to {}", count);
        panic!("{err}");
    }
    if count == 0 {
        holder.free(ctx);
    }
}

/// Handle to an immutable byte string in arena memory.
///
/// ```
/// use direx_mem::{Arena, MemoryContext, RcString};
/// use direx_mem::config::KB;
///
/// let arena = Arena::new(16 * KB).unwrap();
/// let ctx = arena.local_context();
///
/// let hello = RcString::from_bytes(b"hello", &ctx).unwrap();
/// let again = hello.share();
/// assert_eq!(hello.ref_count(), 2);
///
/// hello.free(&ctx);
/// assert_eq!(again.to_str(), Ok("hello"));
/// again.free(&ctx);
/// assert_eq!(ctx.reserved(), 0);
/// ```
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct RcString<'a> {
    ptr: Pointer,
    length: usize,
    holder: Slice<'a, u8>,
}

// SAFETY: the all-zero string is the canonical empty string.
unsafe impl Plain for RcString<'_> {}

impl<'a> RcString<'a> {
    /// Copies `bytes` into a holder of their own.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the holder cannot be reserved.
    pub fn from_bytes<C>(bytes: &[u8], ctx: &C) -> Result<Self>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let holder = new_holder(bytes.len(), ctx)?;
        let ptr = holder.base().byte_add(COUNTER_SIZE);
        // SAFETY: the holder has bytes.len() bytes after the counter.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Ok(RcString {
            ptr,
            length: bytes.len(),
            holder,
        })
    }

    /// A string over `bytes` already written into `holder`, which the new
    /// string owns one reference to.
    pub(crate) fn in_holder(holder: Slice<'a, u8>, ptr: Pointer, length: usize) -> Self {
        RcString { ptr, length, holder }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether this is the canonical empty string, as left behind by
    /// [`RcString::take`].
    #[must_use]
    pub fn is_moved(&self) -> bool {
        self.ptr.is_null() && self.length == 0 && self.holder.is_null()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        if self.length == 0 {
            return &[];
        }
        // SAFETY: ptr..ptr+length lies inside the live holder.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.length) }
    }

    /// # Errors
    ///
    /// If the bytes are not valid UTF-8.
    pub fn to_str(&self) -> std::result::Result<&str, Utf8Error> {
        std::str::from_utf8(self.as_bytes())
    }

    /// Current reference count of the holder, 0 for the empty string.
    #[must_use]
    pub fn ref_count(&self) -> i32 {
        if self.holder.is_null() {
            return 0;
        }
        // SAFETY: a non-null holder is live while this string owns a reference.
        unsafe { counter(self.holder) }.load(Ordering::Acquire)
    }

    /// FNV hash of the bytes.
    #[must_use]
    pub fn hashcode(&self) -> u32 {
        fnv_hash(self.as_bytes())
    }

    /// Another owning handle to the same bytes.
    #[must_use]
    pub fn share(&self) -> Self {
        if !self.holder.is_null() {
            retain_holder(self.holder);
        }
        *self
    }

    /// Moves the string out, leaving the empty string behind.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Drops this handle's reference; the holder is freed through `ctx` when
    /// no string references it any more.
    ///
    /// # Panics
    ///
    /// With misuse checking on, if the count goes negative (a string freed
    /// more often than it was created or shared).
    pub fn free<C>(self, ctx: &C)
    where
        C: MemoryContext<'a> + ?Sized,
    {
        release_holder(self.holder, ctx);
    }
}

impl PartialEq for RcString<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for RcString<'_> {}

impl PartialEq<str> for RcString<'_> {
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<&str> for RcString<'_> {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl KeyHash for RcString<'_> {
    #[inline]
    fn key_hash(&self) -> u32 {
        self.hashcode()
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl fmt::Display for RcString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Debug for RcString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::config::MB;

    #[test]
    fn test_fnv_hash() {
        assert_eq!(fnv_hash(b""), FNV_OFFSET);
        assert_eq!(fnv_hash(b"a"), FNV_OFFSET.wrapping_mul(FNV_PRIME) ^ 0x61);
        assert_ne!(fnv_hash(b"ab"), fnv_hash(b"ba"));
    }

    #[test]
    fn test_key_hash_multiplies_before_xor() {
        let arena = Arena::new(MB).unwrap();
        let ctx = arena.local_context();
        let s = RcString::from_bytes(b"a", &ctx).unwrap();

        let xor_first = (FNV_OFFSET ^ 0x61).wrapping_mul(FNV_PRIME);
        assert_eq!(s.key_hash(), fnv_hash(b"a"));
        assert_ne!(s.key_hash(), xor_first);
        s.free(&ctx);
    }

    #[test]
    fn test_empty_string_is_uncounted() {
        let arena = Arena::new(MB).unwrap();
        let ctx = arena.local_context();

        let empty = RcString::from_bytes(b"", &ctx).unwrap();
        assert!(empty.is_moved());
        assert_eq!(empty.ref_count(), 0);
        assert_eq!(empty.as_bytes(), b"");
        empty.share().free(&ctx);
        empty.free(&ctx);
        assert_eq!(ctx.reserved(), 0);
    }

    #[test]
    fn test_share_and_free() {
        let arena = Arena::new(MB).unwrap();
        let ctx = arena.local_context();

        let first = RcString::from_bytes("héllo".as_bytes(), &ctx).unwrap();
        let second = first.share();
        assert_eq!(first.ref_count(), 2);
        assert_eq!(first, second);
        assert_eq!(first, "héllo");

        first.free(&ctx);
        assert_eq!(second.ref_count(), 1);
        assert_eq!(second.to_string(), "héllo");
        second.free(&ctx);
        assert_eq!(ctx.reserved(), 0);
    }

    #[test]
    fn test_shared_copies_outlive_the_original() {
        let arena = Arena::new(MB).unwrap();
        let ctx = arena.local_context();

        let original = RcString::from_bytes(b"shared", &ctx).unwrap();
        let copies: Vec<_> = (0..3).map(|_| original.share()).collect();
        assert_eq!(original.ref_count(), 4);
        original.free(&ctx);

        for (i, copy) in copies.into_iter().enumerate() {
            assert_eq!(copy.ref_count(), 3 - i as i32);
            assert_eq!(copy, "shared");
            copy.free(&ctx);
        }
        assert_eq!(ctx.reserved(), 0);
    }

    #[test]
    fn test_take() {
        let arena = Arena::new(MB).unwrap();
        let ctx = arena.local_context();

        let mut source = RcString::from_bytes(b"moved", &ctx).unwrap();
        let moved = source.take();
        assert!(source.is_moved());
        assert!(!moved.is_moved());
        assert_eq!(moved.len(), 5);
        source.free(&ctx);
        moved.free(&ctx);
        assert_eq!(ctx.reserved(), 0);
    }

    #[test]
    fn test_equality_ignores_holder() {
        let arena = Arena::new(MB).unwrap();
        let ctx = arena.local_context();

        let a = RcString::from_bytes(b"same", &ctx).unwrap();
        let b = RcString::from_bytes(b"same", &ctx).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key_hash(), b.key_hash());
        assert!(a.key_eq(&b));
        assert_eq!(format!("{a:?}"), "\"same\"");
        a.free(&ctx);
        b.free(&ctx);
    }

    #[test]
    fn test_invalid_utf8() {
        let arena = Arena::new(MB).unwrap();
        let ctx = arena.local_context();
        let s = RcString::from_bytes(&[0xff, 0xfe], &ctx).unwrap();
        assert!(s.to_str().is_err());
        assert_eq!(s.to_string(), "\u{fffd}\u{fffd}");
        s.free(&ctx);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Double free")]
    fn test_negative_count_panics() {
        let arena = Arena::new(MB).unwrap();
        let ctx = arena.local_context();
        // Keep the holder alive through a second reference, then free three times.
        let s = RcString::from_bytes(b"x", &ctx).unwrap();
        let _ = s.share();
        s.free(&ctx);
        s.free(&ctx);
        s.free(&ctx);
    }
}
