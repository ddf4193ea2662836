//! Fixed-capacity arena for `direx` containers.
//!
//! An [`Arena`] owns one contiguous byte region allocated once from the
//! system allocator. Allocation contexts carve sub-ranges out of it; the
//! arena itself never grows, never falls back to another allocator and never
//! moves a reservation.
//!
//! # Architecture
//!
//! - A *frontier* offset separates bytes that were never handed out from
//!   the rest of the region; fresh reservations bump it forward.
//! - Released ranges go to an ordered free map and coalesce with their
//!   neighbours. A free range touching the frontier pulls the frontier back,
//!   so an arena whose reservations were all released is fully compacted.
//! - The first `alignment` bytes are a guard: no reservation starts at the
//!   region's first byte and every handed out address is aligned.
//!
//! # Thread Safety
//!
//! Reservation bookkeeping sits behind a `Mutex`, so the arena is `Sync` and
//! can be the parent of many contexts on many threads. Contexts amortise the
//! lock by taking slabs rather than individual blocks.
//!
//! # Example
//!
//! ```
//! use direx_mem::Arena;
//! use direx_mem::config::KB;
//!
//! let arena = Arena::new(4 * KB).unwrap();
//! let ptr = arena.reserve(100).unwrap();
//! assert_eq!(arena.used(), 112); // rounded to the 16-byte alignment
//!
//! arena.release(ptr, 100);
//! assert_eq!(arena.used(), 0);
//! arena.destroy();
//! ```

use crate::config::{self, ArenaConfig, round_up};
use crate::context::{LocalContext, SharedContext, Upstream};
use crate::error::{Error, Result};
use crate::pointer::Pointer;
use direx_log::{debug, error, warn};
use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Point-in-time accounting of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Usable bytes.
    pub capacity: usize,
    /// Bytes currently reserved.
    pub used: usize,
    /// Highest value `used` has reached.
    pub peak: usize,
    /// Number of disjoint free ranges below the frontier.
    pub free_ranges: usize,
    /// Allocation contexts currently attached.
    pub contexts: usize,
}

/// Mutable bookkeeping, guarded by the arena mutex.
struct ArenaState {
    /// Offset of the first byte never handed out (or handed back to it).
    frontier: usize,
    /// Free ranges below the frontier: offset -> length.
    free: BTreeMap<usize, usize>,
}

/// A fixed-capacity byte pool.
///
/// Contexts borrow the arena, so it cannot be destroyed while one of them
/// is alive. Destroying it with bytes still reserved is a leak and is fatal
/// when misuse checking is on.
pub struct Arena {
    /// Start of the region (the guard bytes).
    start: NonNull<u8>,
    /// Layout used for the system allocation.
    layout: Layout,
    /// Usable bytes.
    capacity: usize,
    /// Alignment and rounding unit of every reservation.
    alignment: usize,
    state: Mutex<ArenaState>,
    used: AtomicUsize,
    peak: AtomicUsize,
    contexts: AtomicUsize,
}

// SAFETY: the region is only reached through reservations handed out under
// the state mutex; the counters are atomic.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates an arena with `capacity` usable bytes.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityError`] if `capacity` is zero or too large to lay out,
    /// [`Error::OutOfMemory`] if the system allocator refuses the region.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(ArenaConfig::new(capacity))
    }

    /// Creates an arena from an explicit configuration.
    ///
    /// # Errors
    ///
    /// As [`Arena::new`], plus [`Error::InvalidAlignment`].
    pub fn with_config(config: ArenaConfig) -> Result<Self> {
        config.validate()?;

        let alignment = config.alignment;
        let capacity = round_up(config.capacity, alignment);
        let total = capacity + alignment;
        let layout = Layout::from_size_align(total, alignment)
            .map_err(|_| Error::CapacityError { capacity: config.capacity })?;

        // SAFETY: layout has a non-zero size (capacity > 0 was validated).
        let raw = unsafe { alloc::alloc(layout) };
        let start = NonNull::new(raw).ok_or(Error::OutOfMemory {
            requested: total,
            available: 0,
        })?;

        debug!("arena created: {} bytes at {:#x}", capacity, start.as_ptr().addr());

        Ok(Arena {
            start,
            layout,
            capacity,
            alignment,
            state: Mutex::new(ArenaState {
                frontier: alignment,
                free: BTreeMap::new(),
            }),
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            contexts: AtomicUsize::new(0),
        })
    }

    /// Creates an exclusive allocation context carving from this arena.
    #[must_use]
    pub fn local_context(&self) -> LocalContext<'_> {
        LocalContext::new(self, None)
    }

    /// Creates a concurrency-safe allocation context carving from this arena.
    #[must_use]
    pub fn shared_context(&self) -> SharedContext<'_> {
        SharedContext::new(self)
    }

    /// Usable bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Alignment of every reservation.
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes not currently reserved (possibly fragmented).
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity - self.used()
    }

    /// Number of live contexts carving from this arena.
    #[must_use]
    pub fn contexts(&self) -> usize {
        self.contexts.load(Ordering::Acquire)
    }

    /// Returns `true` if `ptr` points into the usable region.
    #[must_use]
    pub fn contains(&self, ptr: Pointer) -> bool {
        let offset = ptr.offset_from(self.base());
        ptr.is_not_null() && offset >= self.alignment && offset < self.end()
    }

    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let free_ranges = self.lock().free.len();
        ArenaStats {
            capacity: self.capacity,
            used: self.used(),
            peak: self.peak.load(Ordering::Relaxed),
            free_ranges,
            contexts: self.contexts(),
        }
    }

    /// Reserves `size` bytes, rounded up to the arena alignment.
    ///
    /// Reuses the first free range that fits, otherwise bumps the frontier.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if no free range or tail space is large enough.
    pub fn reserve(&self, size: usize) -> Result<Pointer> {
        let rounded = self.rounded(size).ok_or(Error::OutOfMemory {
            requested: size,
            available: self.available(),
        })?;

        let mut state = self.lock();
        let fit = state
            .free
            .iter()
            .find(|&(_, &len)| len >= rounded)
            .map(|(&offset, &len)| (offset, len));

        let offset = if let Some((offset, len)) = fit {
            state.free.remove(&offset);
            if len > rounded {
                state.free.insert(offset + rounded, len - rounded);
            }
            offset
        } else if state.frontier + rounded <= self.end() {
            let offset = state.frontier;
            state.frontier += rounded;
            offset
        } else {
            drop(state);
            let available = self.available();
            warn!("arena exhausted: requested {} bytes, {} available", rounded, available);
            return Err(Error::OutOfMemory { requested: rounded, available });
        };
        drop(state);

        let used = self.used.fetch_add(rounded, Ordering::AcqRel) + rounded;
        self.peak.fetch_max(used, Ordering::Relaxed);

        Ok(self.base().byte_add(offset))
    }

    /// Returns a range obtained from [`Arena::reserve`] with the same `size`.
    ///
    /// # Panics
    ///
    /// With misuse checking on, panics if the range is outside the arena or
    /// overlaps space that is already free (a double free).
    pub fn release(&self, ptr: Pointer, size: usize) {
        if ptr.is_null() {
            return;
        }
        let Some(rounded) = self.rounded(size) else {
            return;
        };
        let offset = ptr.offset_from(self.base());

        let mut state = self.lock();
        if config::checked() && !Self::is_reserved(&state, offset, rounded, self.alignment) {
            drop(state);
            let err = Error::DoubleFree { addr: ptr.addr() };
            error!("{} ({} bytes)", err, rounded);
            panic!("{err}");
        }

        let mut start = offset;
        let mut len = rounded;

        if let Some((&prev, &prev_len)) = state.free.range(..start).next_back()
            && prev + prev_len == start
        {
            state.free.remove(&prev);
            start = prev;
            len += prev_len;
        }
        if let Some(&next_len) = state.free.get(&(start + len)) {
            state.free.remove(&(start + len));
            len += next_len;
        }

        if start + len == state.frontier {
            state.frontier = start;
        } else {
            state.free.insert(start, len);
        }
        drop(state);

        self.used.fetch_sub(rounded, Ordering::AcqRel);
    }

    /// Destroys the arena, returning its region to the system allocator.
    ///
    /// # Panics
    ///
    /// With misuse checking on, panics if bytes are still reserved or a
    /// context is still attached (only reachable through `mem::forget`).
    pub fn destroy(self) {
        let used = self.used();
        let contexts = self.contexts();
        if used != 0 || contexts != 0 {
            error!(
                "arena destroyed with {} bytes reserved by {} live context(s)",
                used, contexts
            );
            if config::checked() {
                panic!("arena destroyed with {used} bytes still reserved");
            }
        }
        drop(self);
    }

    pub(crate) fn attach(&self) {
        self.contexts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach(&self) {
        self.contexts.fetch_sub(1, Ordering::AcqRel);
    }

    fn base(&self) -> Pointer {
        Pointer::from_raw(self.start.as_ptr())
    }

    /// Offset one past the last usable byte.
    fn end(&self) -> usize {
        self.alignment + self.capacity
    }

    fn rounded(&self, size: usize) -> Option<usize> {
        let size = size.max(1);
        (size <= self.capacity).then(|| round_up(size, self.alignment))
    }

    fn lock(&self) -> MutexGuard<'_, ArenaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `[offset, offset + len)` is handed out: aligned, below the
    /// frontier and disjoint from every free range.
    fn is_reserved(state: &ArenaState, offset: usize, len: usize, alignment: usize) -> bool {
        if offset < alignment || offset % alignment != 0 || offset + len > state.frontier {
            return false;
        }
        let prev_overlaps = state
            .free
            .range(..=offset)
            .next_back()
            .is_some_and(|(&prev, &prev_len)| prev + prev_len > offset);
        let next_overlaps = state
            .free
            .range(offset..)
            .next()
            .is_some_and(|(&next, _)| next < offset + len);
        !prev_overlaps && !next_overlaps
    }
}

impl Upstream for Arena {
    fn acquire(&self, size: usize) -> Result<Pointer> {
        self.reserve(size)
    }

    fn give_back(&self, ptr: Pointer, size: usize) {
        self.release(ptr, size);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        debug!(
            "arena dropped: capacity {} bytes, peak {} bytes",
            self.capacity,
            self.peak.load(Ordering::Relaxed)
        );
        // SAFETY: start was allocated in with_config with this exact layout.
        unsafe {
            alloc::dealloc(self.start.as_ptr(), self.layout);
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Arena")
            .field("capacity", &stats.capacity)
            .field("used", &stats.used)
            .field("peak", &stats.peak)
            .field("free_ranges", &stats.free_ranges)
            .field("contexts", &stats.contexts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KB;

    #[test]
    fn test_arena_rejects_zero_capacity() {
        assert_eq!(Arena::new(0).unwrap_err(), Error::CapacityError { capacity: 0 });
    }

    #[test]
    fn test_arena_reserve_is_aligned_and_inside() {
        let arena = Arena::new(KB).unwrap();

        let a = arena.reserve(1).unwrap();
        let b = arena.reserve(33).unwrap();

        assert!(arena.contains(a));
        assert!(arena.contains(b));
        assert_eq!(a.addr() % 16, 0);
        assert_eq!(b.addr() % 16, 0);
        assert_eq!(b.offset_from(a), 16);
        assert_eq!(arena.used(), 16 + 48);

        arena.release(a, 1);
        arena.release(b, 33);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_arena_out_of_memory_is_recoverable() {
        let arena = Arena::new(64).unwrap();

        let a = arena.reserve(48).unwrap();
        let err = arena.reserve(32).unwrap_err();
        assert_eq!(err, Error::OutOfMemory { requested: 32, available: 16 });

        // Still usable after the failure
        let b = arena.reserve(16).unwrap();
        arena.release(a, 48);
        arena.release(b, 16);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_arena_never_exceeds_capacity() {
        let arena = Arena::new(256).unwrap();
        let mut held = Vec::new();
        while let Ok(ptr) = arena.reserve(16) {
            held.push(ptr);
        }
        assert_eq!(held.len(), 16);
        assert_eq!(arena.used(), arena.capacity());
        for ptr in held {
            arena.release(ptr, 16);
        }
    }

    #[test]
    fn test_arena_coalesces_free_ranges() {
        let arena = Arena::new(KB).unwrap();

        let a = arena.reserve(16).unwrap();
        let b = arena.reserve(16).unwrap();
        let c = arena.reserve(16).unwrap();
        let d = arena.reserve(16).unwrap();

        arena.release(a, 16);
        arena.release(c, 16);
        assert_eq!(arena.stats().free_ranges, 2);

        // b bridges a and c into one range
        arena.release(b, 16);
        assert_eq!(arena.stats().free_ranges, 1);

        // d touches the frontier: everything folds back
        arena.release(d, 16);
        assert_eq!(arena.stats().free_ranges, 0);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_arena_reuses_released_range() {
        let arena = Arena::new(KB).unwrap();

        let a = arena.reserve(64).unwrap();
        let _guard = arena.reserve(16).unwrap();
        arena.release(a, 64);

        let b = arena.reserve(32).unwrap();
        assert_eq!(a, b);
        assert_eq!(arena.stats().peak, 80);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Double free")]
    fn test_arena_double_release_panics() {
        let arena = Arena::new(KB).unwrap();
        let a = arena.reserve(16).unwrap();
        let _b = arena.reserve(16).unwrap();
        arena.release(a, 16);
        arena.release(a, 16);
    }

    #[test]
    fn test_arena_shared_across_threads() {
        let arena = Arena::new(64 * KB).unwrap();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let ptr = arena.reserve(48).unwrap();
                        unsafe { ptr.write(7u64) };
                        arena.release(ptr, 48);
                    }
                });
            }
        });

        assert_eq!(arena.used(), 0);
        arena.destroy();
    }
}
