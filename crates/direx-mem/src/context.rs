//! Allocation contexts: owner-scoped sub-allocators carved from an arena.
//!
//! Containers never talk to the [`Arena`] directly. They reserve and
//! release through a [`MemoryContext`], of which there are two kinds:
//!
//! - [`LocalContext`]: exclusive. No synchronisation at all; the type is
//!   `!Sync`, so the compiler refuses to share one between threads.
//! - [`SharedContext`]: concurrency-safe. Bookkeeping sits behind a mutex
//!   and every reserve/release is linearizable.
//!
//! # Slabs and size classes
//!
//! Both kinds share one allocation strategy, the `Pool`. A pool takes
//! *slabs* from its parent (doubling from
//! [`MIN_SLAB_SIZE`](crate::config::MIN_SLAB_SIZE) up to
//! [`MAX_SLAB_SIZE`](crate::config::MAX_SLAB_SIZE)) and carves power-of-two
//! blocks out of them, 16 bytes to
//! [`MAX_SMALL_SIZE`](crate::config::MAX_SMALL_SIZE). Released blocks go on
//! a per-class free list and are reused by the same context. Bigger requests,
//! and small ones when no slab fits in the parent any more, are *dedicated*
//! blocks passed straight through to the parent.
//!
//! # Fan-out
//!
//! [`SharedContext::local`] creates an exclusive child whose slabs come from
//! the shared parent. Workers each take a child, allocate scratch data without
//! contention and destroy it before joining:
//!
//! ```
//! use direx_mem::{Arena, MemoryContext, Slice};
//! use direx_mem::config::MB;
//!
//! let arena = Arena::new(MB).unwrap();
//! let shared = arena.shared_context();
//!
//! std::thread::scope(|s| {
//!     for worker in 0..4 {
//!         let shared = &shared;
//!         s.spawn(move || {
//!             let local = shared.local();
//!             let mut scratch = Slice::<u32>::default();
//!             for i in 0..100 {
//!                 scratch.append(worker * 100 + i, &local).unwrap();
//!             }
//!             scratch.free(&local);
//!             local.destroy();
//!         });
//!     }
//! });
//!
//! assert_eq!(shared.lent(), 0);
//! ```
//!
//! # Teardown
//!
//! Destroying a context (explicitly or by dropping it) hands every slab and
//! dedicated block back to its parent, including blocks the owner forgot to
//! release. Contexts borrow their parent, so the parent outlives them.

use crate::arena::Arena;
use crate::config::{self, ALIGNMENT, MAX_SLAB_SIZE, MAX_SMALL_SIZE, MIN_SLAB_SIZE, round_up};
use crate::error::{Error, Result};
use crate::pointer::Pointer;
use direx_log::{debug, error, trace};
use fxhash::FxBuildHasher;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Smallest size class (bytes).
const MIN_CLASS_SIZE: usize = ALIGNMENT;

/// log2 of [`MIN_CLASS_SIZE`].
const MIN_CLASS_SHIFT: u32 = MIN_CLASS_SIZE.trailing_zeros();

/// Number of power-of-two size classes up to [`MAX_SMALL_SIZE`].
const NUM_CLASSES: usize = (MAX_SMALL_SIZE.trailing_zeros() - MIN_CLASS_SHIFT + 1) as usize;

type AddrMap<V> = HashMap<usize, V, FxBuildHasher>;

/// A sub-allocator that containers reserve and release through.
///
/// Implementations must return ranges aligned to at least
/// [`ALIGNMENT`](crate::config::ALIGNMENT) bytes that stay valid until released
/// or until the context is destroyed.
///
/// `'a` bounds how long the memory behind a reservation can exist. Containers
/// allocated through a context carry the same lifetime, so a handle cannot
/// outlive the arena (or the shared parent) it points into.
pub trait MemoryContext<'a> {
    /// Reserves `size` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the underlying arena cannot satisfy it.
    fn reserve(&self, size: usize) -> Result<Pointer>;

    /// Releases a range obtained from [`MemoryContext::reserve`] with the same
    /// `size`. Releasing null is a no-op.
    ///
    /// # Panics
    ///
    /// With misuse checking on, panics if the range is not currently reserved
    /// through this context (double free or foreign pointer).
    fn release(&self, ptr: Pointer, size: usize);

    /// Bytes currently reserved through this context.
    fn reserved(&self) -> usize;

    /// Number of live reservations.
    fn live(&self) -> usize;

    /// Snapshot of the context's accounting.
    fn stats(&self) -> ContextStats;
}

/// Where a pool takes slabs and dedicated blocks from.
pub(crate) trait Upstream: Sync {
    fn acquire(&self, size: usize) -> Result<Pointer>;
    fn give_back(&self, ptr: Pointer, size: usize);
}

/// Accounting snapshot of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Bytes currently reserved by the owner.
    pub reserved: usize,
    /// Live reservations.
    pub live: usize,
    /// Slabs held from the parent.
    pub slabs: usize,
    /// Total bytes of those slabs.
    pub slab_bytes: usize,
    /// Dedicated blocks held from the parent.
    pub dedicated: usize,
}

/// Size-class allocator shared by both context kinds.
#[derive(Default)]
struct Pool {
    /// Slabs taken from the parent: (start, size).
    slabs: Vec<(Pointer, usize)>,
    /// Bump cursor inside the newest slab.
    cursor: Pointer,
    /// End of the newest slab.
    limit: Pointer,
    /// Size of the next slab to request.
    next_slab: usize,
    /// Released blocks per size class.
    free: [Vec<Pointer>; NUM_CLASSES],
    /// Blocks passed straight through to the parent: addr -> (block, size).
    dedicated: AddrMap<(Pointer, usize)>,
    /// Live reservations (checked mode only): addr -> block size.
    live: AddrMap<usize>,
    /// Where each block was last released, for double-free reports.
    #[cfg(feature = "free-backtrace")]
    released: AddrMap<backtrace::Backtrace>,
    reserved: usize,
    live_count: usize,
}

/// Size class index of a block size, `None` above [`MAX_SMALL_SIZE`].
fn class_of(size: usize) -> Option<usize> {
    if size > MAX_SMALL_SIZE {
        return None;
    }
    let block = size.max(MIN_CLASS_SIZE).next_power_of_two();
    Some((block.trailing_zeros() - MIN_CLASS_SHIFT) as usize)
}

const fn class_size(class: usize) -> usize {
    MIN_CLASS_SIZE << class
}

/// Bytes actually set aside for a request of `size`.
fn block_size(size: usize) -> usize {
    match class_of(size) {
        Some(class) => class_size(class),
        None => round_up(size, ALIGNMENT),
    }
}

impl Pool {
    fn new() -> Self {
        Pool {
            next_slab: MIN_SLAB_SIZE,
            ..Default::default()
        }
    }

    fn reserve(&mut self, size: usize, up: &dyn Upstream) -> Result<Pointer> {
        let block = block_size(size);
        let ptr = match class_of(size) {
            Some(class) => self.reserve_small(class, up)?,
            None => self.reserve_dedicated(block, up)?,
        };

        self.reserved += block;
        self.live_count += 1;
        if config::checked() {
            self.live.insert(ptr.addr(), block);
            #[cfg(feature = "free-backtrace")]
            self.released.remove(&ptr.addr());
        }
        Ok(ptr)
    }

    fn reserve_small(&mut self, class: usize, up: &dyn Upstream) -> Result<Pointer> {
        if let Some(ptr) = self.free[class].pop() {
            return Ok(ptr);
        }

        let block = class_size(class);
        if self.cursor.is_null() || self.limit.offset_from(self.cursor) < block {
            if !self.grow(block, up) {
                // No slab fits any more; take the block from the parent itself.
                return self.reserve_dedicated(block, up);
            }
        }

        let ptr = self.cursor;
        self.cursor = self.cursor.byte_add(block);
        Ok(ptr)
    }

    /// Takes a new slab able to hold `block`, halving the request on
    /// exhaustion. Returns `false` if not even the smallest slab fits.
    fn grow(&mut self, block: usize, up: &dyn Upstream) -> bool {
        let floor = MIN_SLAB_SIZE.max(block);
        let mut size = self.next_slab.max(floor);
        loop {
            match up.acquire(size) {
                Ok(slab) => {
                    trace!("slab acquired: {} bytes at {:?}", size, slab);
                    self.slabs.push((slab, size));
                    self.cursor = slab;
                    self.limit = slab.byte_add(size);
                    self.next_slab = (size * 2).min(MAX_SLAB_SIZE);
                    return true;
                }
                Err(_) if size > floor => size = (size / 2).max(floor),
                Err(_) => return false,
            }
        }
    }

    fn reserve_dedicated(&mut self, block: usize, up: &dyn Upstream) -> Result<Pointer> {
        let ptr = up.acquire(block)?;
        self.dedicated.insert(ptr.addr(), (ptr, block));
        Ok(ptr)
    }

    fn release(&mut self, ptr: Pointer, size: usize, up: &dyn Upstream) {
        if ptr.is_null() {
            return;
        }
        let block = block_size(size);

        if config::checked() {
            match self.live.remove(&ptr.addr()) {
                Some(held) if held == block => {}
                Some(held) => {
                    error!("release of {:?} with {} bytes, reserved with {}", ptr, block, held);
                    panic!("release size mismatch at {ptr:?}: {block} != {held}");
                }
                None => self.double_free(ptr),
            }
            #[cfg(feature = "free-backtrace")]
            self.released.insert(ptr.addr(), backtrace::Backtrace::new());
        }

        if let Some((block_ptr, dedicated)) = self.dedicated.remove(&ptr.addr()) {
            up.give_back(block_ptr, dedicated);
        } else if let Some(class) = class_of(size) {
            self.free[class].push(ptr);
        }

        self.reserved -= block;
        self.live_count -= 1;
    }

    #[cold]
    fn double_free(&self, ptr: Pointer) -> ! {
        let err = Error::DoubleFree { addr: ptr.addr() };
        error!("{}", err);
        #[cfg(feature = "free-backtrace")]
        if let Some(first) = self.released.get(&ptr.addr()) {
            error!("first released at:\n{:?}", first);
        }
        panic!("{err}");
    }

    /// Hands every slab and dedicated block back to the parent.
    fn drain(&mut self, up: &dyn Upstream) {
        for (_, (ptr, size)) in self.dedicated.drain() {
            up.give_back(ptr, size);
        }
        for (slab, size) in self.slabs.drain(..) {
            up.give_back(slab, size);
        }
        *self = Pool::new();
    }

    fn stats(&self) -> ContextStats {
        ContextStats {
            reserved: self.reserved,
            live: self.live_count,
            slabs: self.slabs.len(),
            slab_bytes: self.slabs.iter().map(|&(_, size)| size).sum(),
            dedicated: self.dedicated.len(),
        }
    }
}

/// An exclusive, unsynchronised allocation context.
///
/// Create one per logical owner (per worker). The type is not `Sync`; moving
/// it to another thread is fine, sharing it is rejected at compile time.
///
/// ```
/// use direx_mem::{Arena, MemoryContext};
/// use direx_mem::config::KB;
///
/// let arena = Arena::new(64 * KB).unwrap();
/// let local = arena.local_context();
///
/// let ptr = local.reserve(24).unwrap();
/// assert_eq!(local.reserved(), 32);
/// local.release(ptr, 24);
/// assert_eq!(local.reserved(), 0);
/// ```
pub struct LocalContext<'a> {
    arena: &'a Arena,
    /// Set when this is a nested child of a shared context.
    shared: Option<&'a SharedContext<'a>>,
    pool: RefCell<Pool>,
}

impl<'a> LocalContext<'a> {
    pub(crate) fn new(arena: &'a Arena, shared: Option<&'a SharedContext<'a>>) -> Self {
        arena.attach();
        LocalContext {
            arena,
            shared,
            pool: RefCell::new(Pool::new()),
        }
    }

    fn parent(&self) -> &'a dyn Upstream {
        match self.shared {
            Some(shared) => shared,
            None => self.arena,
        }
    }

    /// The arena this context ultimately carves from.
    #[must_use]
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Destroys the context, returning everything it holds to its parent.
    pub fn destroy(self) {
        drop(self);
    }
}

impl<'a> MemoryContext<'a> for LocalContext<'a> {
    fn reserve(&self, size: usize) -> Result<Pointer> {
        self.pool.borrow_mut().reserve(size, self.parent())
    }

    fn release(&self, ptr: Pointer, size: usize) {
        self.pool.borrow_mut().release(ptr, size, self.parent());
    }

    fn reserved(&self) -> usize {
        self.pool.borrow().reserved
    }

    fn live(&self) -> usize {
        self.pool.borrow().live_count
    }

    fn stats(&self) -> ContextStats {
        self.pool.borrow().stats()
    }
}

impl Drop for LocalContext<'_> {
    fn drop(&mut self) {
        let parent = self.parent();
        let pool = self.pool.get_mut();
        if pool.live_count != 0 {
            debug!(
                "local context reclaiming {} live reservation(s), {} bytes",
                pool.live_count, pool.reserved
            );
        }
        pool.drain(parent);
        if let Some(shared) = self.shared {
            shared.children.fetch_sub(1, Ordering::AcqRel);
        }
        self.arena.detach();
    }
}

/// A concurrency-safe allocation context.
///
/// Every operation locks an internal mutex around the pool. For hot loops,
/// spawn per-worker children with [`SharedContext::local`].
pub struct SharedContext<'a> {
    arena: &'a Arena,
    pool: Mutex<Pool>,
    /// Bytes currently lent to nested children as slabs or dedicated blocks.
    lent: AtomicUsize,
    children: AtomicUsize,
}

impl<'a> SharedContext<'a> {
    pub(crate) fn new(arena: &'a Arena) -> Self {
        arena.attach();
        SharedContext {
            arena,
            pool: Mutex::new(Pool::new()),
            lent: AtomicUsize::new(0),
            children: AtomicUsize::new(0),
        }
    }

    /// Creates an exclusive child context taking its slabs from this one.
    #[must_use]
    pub fn local(&self) -> LocalContext<'_> {
        self.children.fetch_add(1, Ordering::AcqRel);
        LocalContext::new(self.arena, Some(self))
    }

    /// The arena this context carves from.
    #[must_use]
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Bytes currently lent to nested children.
    #[must_use]
    pub fn lent(&self) -> usize {
        self.lent.load(Ordering::Acquire)
    }

    /// Nested children created so far that have not been destroyed.
    #[must_use]
    pub fn children(&self) -> usize {
        self.children.load(Ordering::Acquire)
    }

    /// Destroys the context, returning everything it holds to the arena.
    ///
    /// # Panics
    ///
    /// With misuse checking on, panics if bytes are still lent to children
    /// (only reachable if a child was leaked with `mem::forget`).
    pub fn destroy(self) {
        let lent = self.lent();
        if lent != 0 && config::checked() {
            panic!("shared context destroyed with {lent} bytes still lent to children");
        }
        drop(self);
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<'a> MemoryContext<'a> for SharedContext<'a> {
    fn reserve(&self, size: usize) -> Result<Pointer> {
        self.lock().reserve(size, self.arena)
    }

    fn release(&self, ptr: Pointer, size: usize) {
        self.lock().release(ptr, size, self.arena);
    }

    fn reserved(&self) -> usize {
        self.lock().reserved
    }

    fn live(&self) -> usize {
        self.lock().live_count
    }

    fn stats(&self) -> ContextStats {
        self.lock().stats()
    }
}

impl Upstream for SharedContext<'_> {
    fn acquire(&self, size: usize) -> Result<Pointer> {
        let ptr = self.arena.reserve(size)?;
        self.lent.fetch_add(size, Ordering::AcqRel);
        Ok(ptr)
    }

    fn give_back(&self, ptr: Pointer, size: usize) {
        self.arena.release(ptr, size);
        self.lent.fetch_sub(size, Ordering::AcqRel);
    }
}

impl Drop for SharedContext<'_> {
    fn drop(&mut self) {
        let lent = self.lent();
        if lent != 0 {
            error!("shared context dropped with {} bytes lent to children", lent);
        }
        let pool = self.pool.get_mut().unwrap_or_else(PoisonError::into_inner);
        if pool.live_count != 0 {
            debug!(
                "shared context reclaiming {} live reservation(s), {} bytes",
                pool.live_count, pool.reserved
            );
        }
        pool.drain(self.arena);
        self.arena.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KB, MB};

    #[test]
    fn test_size_classes() {
        assert_eq!(NUM_CLASSES, 8);
        assert_eq!(class_of(1), Some(0));
        assert_eq!(class_of(16), Some(0));
        assert_eq!(class_of(17), Some(1));
        assert_eq!(class_of(MAX_SMALL_SIZE), Some(NUM_CLASSES - 1));
        assert_eq!(class_of(MAX_SMALL_SIZE + 1), None);
        assert_eq!(block_size(24), 32);
        assert_eq!(block_size(3000), 3008);
    }

    #[test]
    fn test_local_reuses_released_blocks() {
        let arena = Arena::new(MB).unwrap();
        let local = arena.local_context();

        let a = local.reserve(40).unwrap();
        local.release(a, 40);
        let b = local.reserve(64).unwrap();
        assert_eq!(a, b);

        local.release(b, 64);
        assert_eq!(local.reserved(), 0);
        assert_eq!(local.live(), 0);
    }

    #[test]
    fn test_local_slabs_double() {
        let arena = Arena::new(MB).unwrap();
        let local = arena.local_context();

        let blocks: Vec<_> = (0..200).map(|_| local.reserve(MAX_SMALL_SIZE).unwrap()).collect();
        let stats = local.stats();
        assert!(stats.slabs > 1);
        assert_eq!(stats.live, 200);
        assert_eq!(stats.reserved, 200 * MAX_SMALL_SIZE);

        for ptr in blocks {
            local.release(ptr, MAX_SMALL_SIZE);
        }
        assert_eq!(local.reserved(), 0);
    }

    #[test]
    fn test_dedicated_blocks_go_to_arena() {
        let arena = Arena::new(MB).unwrap();
        let local = arena.local_context();

        let big = local.reserve(10 * KB).unwrap();
        assert_eq!(arena.used(), 10 * KB);
        assert_eq!(local.stats().dedicated, 1);

        local.release(big, 10 * KB);
        assert_eq!(arena.used(), 0);
        assert_eq!(local.stats().dedicated, 0);
    }

    #[test]
    fn test_small_arena_falls_back_to_dedicated() {
        let arena = Arena::new(KB).unwrap();
        let local = arena.local_context();

        // A 4 KiB slab cannot fit in a 1 KiB arena
        let ptr = local.reserve(32).unwrap();
        assert_eq!(local.stats().slabs, 0);
        assert_eq!(local.stats().dedicated, 1);
        assert_eq!(arena.used(), 32);

        local.release(ptr, 32);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_out_of_memory_surfaces() {
        let arena = Arena::new(KB).unwrap();
        let local = arena.local_context();

        let err = local.reserve(2 * KB).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        assert_eq!(local.reserved(), 0);
    }

    #[test]
    fn test_destroy_returns_everything() {
        let arena = Arena::new(MB).unwrap();
        {
            let local = arena.local_context();
            assert_eq!(arena.contexts(), 1);
            let _leaked_small = local.reserve(100).unwrap();
            let _leaked_big = local.reserve(8 * KB).unwrap();
            assert!(arena.used() > 0);
            local.destroy();
        }
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.contexts(), 0);
        arena.destroy();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Double free")]
    fn test_local_double_release_panics() {
        let arena = Arena::new(MB).unwrap();
        let local = arena.local_context();
        let ptr = local.reserve(16).unwrap();
        local.release(ptr, 16);
        local.release(ptr, 16);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Double free")]
    fn test_foreign_release_panics() {
        let arena = Arena::new(MB).unwrap();
        let first = arena.local_context();
        let second = arena.local_context();
        let ptr = first.reserve(16).unwrap();
        second.release(ptr, 16);
    }

    #[test]
    fn test_shared_context_concurrent() {
        let arena = Arena::new(4 * MB).unwrap();
        let shared = arena.shared_context();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let mut held = Vec::new();
                    for i in 0..500 {
                        held.push((shared.reserve(16 + i % 200).unwrap(), 16 + i % 200));
                    }
                    for (ptr, size) in held {
                        shared.release(ptr, size);
                    }
                });
            }
        });

        assert_eq!(shared.reserved(), 0);
        assert_eq!(shared.live(), 0);
    }

    #[test]
    fn test_nested_children_borrow_from_shared() {
        let arena = Arena::new(4 * MB).unwrap();
        let shared = arena.shared_context();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let local = shared.local();
                    assert!(shared.children() >= 1);
                    let ptr = local.reserve(256).unwrap();
                    assert!(shared.lent() >= MIN_SLAB_SIZE);
                    local.release(ptr, 256);
                    local.destroy();
                });
            }
        });

        assert_eq!(shared.lent(), 0);
        assert_eq!(shared.children(), 0);
        assert_eq!(arena.contexts(), 1);
        shared.destroy();
        assert_eq!(arena.used(), 0);
    }
}
