//! Thread-safe packing of small strings into shared holders.
//!
//! Allocating a holder per string wastes a counter and a size-class block on
//! every short string. A [`StringFactory`] keeps one *active slab*, a holder
//! of `slab_size` bytes, and copies small strings into it back to back. Each
//! string owns a reference to the slab, and so does the factory while the
//! slab is active, so the slab is freed once the factory has moved on and the
//! last string in it is freed.
//!
//! # Strategy
//!
//! - Empty input: the canonical empty string, no allocation.
//! - Longer than `slab_size / 4`: a dedicated holder.
//! - Otherwise: packed into the active slab. When it lacks room the factory
//!   allocates a fresh slab first, then drops its reference to the old one.
//!
//! # Contexts
//!
//! Every holder is freed through the context passed to whichever call drops
//! its last reference. Use one context per factory, normally a
//! [`SharedContext`](crate::SharedContext) when several threads create
//! strings. The factory holds a slab, so it carries that context's lifetime
//! like the strings it returns.
//!
//! ```
//! use direx_mem::{Arena, MemoryContext, StringFactory};
//! use direx_mem::config::MB;
//!
//! let arena = Arena::new(MB).unwrap();
//! let ctx = arena.shared_context();
//! let factory = StringFactory::new();
//!
//! let a = factory.create_from_str("hello", &ctx).unwrap();
//! let b = factory.create_from_str("world", &ctx).unwrap();
//! assert_eq!(a.ref_count(), 3); // a, b and the factory share one slab
//!
//! a.free(&ctx);
//! b.free(&ctx);
//! factory.destroy(&ctx);
//! assert_eq!(ctx.reserved(), 0);
//! ```

use crate::config::DEFAULT_STRING_SLAB;
use crate::context::MemoryContext;
use crate::error::Result;
use crate::slice::Slice;
use crate::string::{COUNTER_SIZE, RcString, new_holder, release_holder, retain_holder};
use direx_log::trace;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Smallest accepted slab size.
const MIN_SLAB: usize = 64;

#[derive(Default)]
struct ActiveSlab<'a> {
    holder: Slice<'a, u8>,
    /// Next free byte offset in the holder data.
    cursor: usize,
}

impl ActiveSlab<'_> {
    fn room(&self) -> usize {
        self.holder.len().saturating_sub(self.cursor)
    }
}

/// Creates [`RcString`]s, packing small ones into shared slabs.
pub struct StringFactory<'a> {
    slab_size: usize,
    active: Mutex<ActiveSlab<'a>>,
}

impl Default for StringFactory<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> StringFactory<'a> {
    /// Factory with [`DEFAULT_STRING_SLAB`]-byte slabs.
    #[must_use]
    pub fn new() -> Self {
        Self::with_slab_size(DEFAULT_STRING_SLAB)
    }

    /// Factory with `slab_size`-byte slabs (at least 64 bytes).
    #[must_use]
    pub fn with_slab_size(slab_size: usize) -> Self {
        StringFactory {
            slab_size: slab_size.max(MIN_SLAB),
            active: Mutex::new(ActiveSlab::default()),
        }
    }

    #[must_use]
    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Copies `bytes` into arena memory.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`](crate::Error::OutOfMemory) if a holder or a new
    /// slab cannot be reserved; the factory is left as it was.
    pub fn create_from_bytes<C>(&self, bytes: &[u8], ctx: &C) -> Result<RcString<'a>>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        if bytes.is_empty() {
            return Ok(RcString::default());
        }
        if bytes.len() > self.slab_size / 4 {
            return RcString::from_bytes(bytes, ctx);
        }

        let mut active = self.lock();
        if active.holder.is_null() || active.room() < bytes.len() {
            let fresh = new_holder(self.slab_size - COUNTER_SIZE, ctx)?;
            let retired = std::mem::replace(
                &mut *active,
                ActiveSlab {
                    holder: fresh,
                    cursor: COUNTER_SIZE,
                },
            );
            trace!(
                "string slab rotated: {} bytes at {:?}, {} bytes unused in previous",
                self.slab_size,
                fresh.base(),
                retired.room()
            );
            release_holder(retired.holder, ctx);
        }

        let ptr = active.holder.base().byte_add(active.cursor);
        // SAFETY: room() >= bytes.len() past the cursor; packed bytes never
        // overlap and are never written again.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        active.cursor += bytes.len();
        retain_holder(active.holder);

        Ok(RcString::in_holder(active.holder, ptr, bytes.len()))
    }

    /// Copies `s` into arena memory.
    ///
    /// # Errors
    ///
    /// As for [`StringFactory::create_from_bytes`].
    pub fn create_from_str<C>(&self, s: &str, ctx: &C) -> Result<RcString<'a>>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        self.create_from_bytes(s.as_bytes(), ctx)
    }

    /// Drops the factory's reference to its active slab. Strings it created
    /// stay valid until they are freed.
    pub fn destroy<C>(self, ctx: &C)
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let active = self.active.into_inner().unwrap_or_else(PoisonError::into_inner);
        release_holder(active.holder, ctx);
    }

    fn lock(&self) -> MutexGuard<'_, ActiveSlab<'a>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for StringFactory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.lock();
        f.debug_struct("StringFactory")
            .field("slab_size", &self.slab_size)
            .field("slab", &active.holder.base())
            .field("room", &active.room())
            .finish()
    }
}
