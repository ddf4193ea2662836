//! Growable arrays stored in arena memory.
//!
//! A [`Slice<T>`] is a one-word handle. The array itself is a header
//! `{ base, length, capacity }` reserved from a [`MemoryContext`], pointing at
//! a separate block of elements. Copies of a handle alias the same header, so
//! an element written through one copy is visible through every other copy,
//! and growth through one copy is observed by all of them.
//!
//! Nothing is freed implicitly. An array lives until [`Slice::free`] is called
//! with the context it was allocated from (or until that context is
//! destroyed). Freeing an array of arrays frees only the outer one.
//!
//! A handle carries the lifetime `'a` of the context it was allocated from,
//! so it cannot outlive the arena behind it. Within that lifetime the
//! element storage moves whenever any copy of the handle grows the array,
//! which is why the reference-returning views ([`Slice::as_slice`],
//! [`Slice::ref_at`], ...) are `unsafe`: the caller promises that no copy
//! grows or frees the array while the reference is alive. Everything that
//! reads or writes by value ([`Slice::get`], [`Slice::set`], iteration) is
//! safe.
//!
//! ```
//! use direx_mem::{Arena, Slice};
//! use direx_mem::config::KB;
//!
//! let arena = Arena::new(64 * KB).unwrap();
//! let ctx = arena.local_context();
//!
//! let mut values = Slice::<u32>::default();
//! for v in [3, 1, 4] {
//!     values.append(v, &ctx).unwrap();
//! }
//! values.append_batch(values, &ctx).unwrap();
//!
//! assert_eq!(values.to_vec(), [3, 1, 4, 3, 1, 4]);
//! assert_eq!(values.to_string(), "[3 1 4 3 1 4]");
//! values.free(&ctx);
//! ```

use crate::config::{ALIGNMENT, MIN_CAPACITY};
use crate::context::MemoryContext;
use crate::error::{Error, Result};
use crate::plain::Plain;
use crate::pointer::Pointer;
use direx_log::error;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;

/// In-arena part of a [`Slice`].
#[repr(C)]
#[derive(Clone, Copy)]
struct SliceHeader {
    base: Pointer,
    length: usize,
    capacity: usize,
}

impl SliceHeader {
    const EMPTY: SliceHeader = SliceHeader {
        base: Pointer::null(),
        length: 0,
        capacity: 0,
    };
}

const HEADER_SIZE: usize = size_of::<SliceHeader>();

/// Bytes needed for `count` elements of `T`.
fn bytes_for<T>(count: usize) -> Result<usize> {
    const { assert!(align_of::<T>() <= ALIGNMENT) };
    count
        .checked_mul(size_of::<T>())
        .filter(|&bytes| bytes <= isize::MAX as usize)
        .ok_or(Error::OutOfMemory {
            requested: usize::MAX,
            available: 0,
        })
}

#[cold]
#[track_caller]
fn bounds_violation(index: usize, length: usize) -> ! {
    let err = Error::BoundsViolation { index, length };
    error!("{}", err);
    panic!("{err}");
}

/// Handle to a growable array of `T` in arena memory.
///
/// The default (all-zero) handle is an empty, unallocated array; appending to
/// it allocates. See the [module documentation](self) for aliasing rules.
///
/// A handle cannot escape the arena it was allocated from:
///
/// ```compile_fail
/// use direx_mem::{Arena, Slice};
///
/// let slice = {
///     let arena = Arena::new(1024).unwrap();
///     let ctx = arena.local_context();
///     Slice::<u8>::with_capacity(&ctx, 4).unwrap()
/// };
/// assert!(slice.is_empty());
/// ```
///
/// and borrowing its storage takes an `unsafe` block, since a copy of the
/// handle may move it:
///
/// ```compile_fail
/// use direx_mem::{Arena, Slice};
///
/// let arena = Arena::new(1024).unwrap();
/// let ctx = arena.local_context();
/// let mut slice = Slice::from_slice(&ctx, &[1u64, 2, 3, 4]).unwrap();
/// let alias = slice;
/// let view = alias.as_slice();
/// slice.append(5, &ctx).unwrap();
/// assert_eq!(view, [1, 2, 3, 4]);
/// ```
#[repr(transparent)]
pub struct Slice<'a, T: Plain> {
    header: Pointer,
    _marker: PhantomData<(&'a (), T)>,
}

impl<T: Plain> Clone for Slice<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Plain> Copy for Slice<'_, T> {}

impl<T: Plain> Default for Slice<'_, T> {
    fn default() -> Self {
        Slice {
            header: Pointer::null(),
            _marker: PhantomData,
        }
    }
}

impl<T: Plain> PartialEq for Slice<'_, T> {
    /// Two handles are equal when they alias the same array.
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
    }
}

impl<T: Plain> Eq for Slice<'_, T> {}

// SAFETY: the all-zero handle is the empty array.
unsafe impl<T: Plain> Plain for Slice<'_, T> {}

impl<'a, T: Plain> Slice<'a, T> {
    /// Allocates an empty array with room for `capacity` elements.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the header or the elements cannot be reserved.
    pub fn with_capacity<C>(ctx: &C, capacity: usize) -> Result<Self>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let bytes = bytes_for::<T>(capacity)?;
        let header = ctx.reserve(HEADER_SIZE)?;
        let base = if capacity == 0 {
            Pointer::null()
        } else {
            match ctx.reserve(bytes) {
                Ok(base) => base,
                Err(err) => {
                    ctx.release(header, HEADER_SIZE);
                    return Err(err);
                }
            }
        };

        // SAFETY: header was just reserved with room for a SliceHeader.
        unsafe {
            header.write(SliceHeader {
                base,
                length: 0,
                capacity,
            });
        }
        Ok(Slice {
            header,
            _marker: PhantomData,
        })
    }

    /// Allocates an array of `length` zero values.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the array cannot be reserved.
    pub fn with_length<C>(ctx: &C, length: usize) -> Result<Self>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let slice = Self::with_capacity(ctx, length)?;
        if length > 0 {
            let mut header = slice.header();
            // SAFETY: base holds `capacity == length` elements; Plain makes
            // zeroed bytes valid values.
            unsafe { ptr::write_bytes(header.base.cast::<T>(), 0, length) };
            header.length = length;
            slice.store(header);
        }
        Ok(slice)
    }

    /// Allocates an array holding a copy of `values`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the array cannot be reserved.
    pub fn from_slice<C>(ctx: &C, values: &[T]) -> Result<Self>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let slice = Self::with_capacity(ctx, values.len())?;
        if !values.is_empty() {
            let mut header = slice.header();
            // SAFETY: fresh storage for exactly values.len() elements.
            unsafe {
                ptr::copy_nonoverlapping(values.as_ptr(), header.base.cast::<T>(), values.len());
            }
            header.length = values.len();
            slice.store(header);
        }
        Ok(slice)
    }

    /// Whether this handle points at no array at all.
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.header.is_null()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.header().length
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.header().capacity
    }

    /// Returns a copy of the element at `index`.
    ///
    /// # Panics
    ///
    /// If `index >= len()`.
    #[inline]
    #[must_use]
    #[track_caller]
    pub fn get(&self, index: usize) -> T {
        let header = self.header();
        if index >= header.length {
            bounds_violation(index, header.length);
        }
        // SAFETY: index < length <= capacity.
        unsafe { header.base.element_add::<T>(index).read::<T>() }
    }

    /// Overwrites the element at `index`.
    ///
    /// # Panics
    ///
    /// If `index >= len()`. The array never grows implicitly.
    #[inline]
    #[track_caller]
    pub fn set(&self, index: usize, value: T) {
        let header = self.header();
        if index >= header.length {
            bounds_violation(index, header.length);
        }
        // SAFETY: index < length <= capacity.
        unsafe { header.base.element_add::<T>(index).write(value) }
    }

    /// Borrows the element at `index` for in-place mutation.
    ///
    /// ```
    /// use direx_mem::{Arena, Slice};
    /// use direx_mem::config::KB;
    ///
    /// let arena = Arena::new(16 * KB).unwrap();
    /// let ctx = arena.local_context();
    /// let mut rows = Slice::<Slice<u8>>::with_length(&ctx, 1).unwrap();
    ///
    /// // SAFETY: nothing else touches `rows` while the reference is alive.
    /// unsafe { rows.ref_at(0) }.append(7, &ctx).unwrap();
    /// assert_eq!(rows.get(0).to_vec(), [7]);
    ///
    /// rows.get(0).free(&ctx);
    /// rows.free(&ctx);
    /// ```
    ///
    /// # Safety
    ///
    /// Until the reference is dropped, no copy of this handle may grow,
    /// free or otherwise write the array. Growth moves the elements and
    /// leaves the reference dangling.
    ///
    /// # Panics
    ///
    /// If `index >= len()`.
    #[inline]
    #[track_caller]
    pub unsafe fn ref_at(&mut self, index: usize) -> &mut T {
        let header = self.header();
        if index >= header.length {
            bounds_violation(index, header.length);
        }
        // SAFETY: index < length <= capacity; the caller keeps the storage
        // in place for the borrow.
        unsafe { header.base.element_add::<T>(index).as_mut::<T>() }
    }

    #[must_use]
    pub fn first(&self) -> Option<T> {
        (!self.is_empty()).then(|| self.get(0))
    }

    #[must_use]
    pub fn last(&self) -> Option<T> {
        self.len().checked_sub(1).map(|last| self.get(last))
    }

    /// Appends `value`, growing to `max(MIN_CAPACITY, 2 * capacity)` when full.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if growth fails; the array is left unchanged.
    pub fn append<C>(&mut self, value: T, ctx: &C) -> Result<()>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let header = self.header();
        if header.length == header.capacity {
            let grown = header.capacity.saturating_mul(2).max(MIN_CAPACITY);
            self.grow_to(grown, ctx)?;
        }

        let mut header = self.header();
        // SAFETY: length < capacity after growth.
        unsafe { header.base.element_add::<T>(header.length).write(value) };
        header.length += 1;
        self.store(header);
        Ok(())
    }

    /// Appends every element `other` holds at the time of the call.
    ///
    /// `other` may alias `self`: appending an array to itself doubles it.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if growth fails; the array is left unchanged.
    pub fn append_batch<C>(&mut self, other: Slice<'a, T>, ctx: &C) -> Result<()>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let count = other.len();
        if count == 0 {
            return Ok(());
        }
        self.reserve(count, ctx)?;

        // Re-read: if other aliases self, its base moved with the growth.
        let source = other.header().base;
        let mut header = self.header();
        // SAFETY: source holds `count` elements, destination has room for them.
        unsafe {
            ptr::copy(
                source.cast::<T>(),
                header.base.element_add::<T>(header.length).cast::<T>(),
                count,
            );
        }
        header.length += count;
        self.store(header);
        Ok(())
    }

    /// Appends a copy of `values`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if growth fails; the array is left unchanged.
    pub fn extend_from_slice<C>(&mut self, values: &[T], ctx: &C) -> Result<()>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        if values.is_empty() {
            return Ok(());
        }
        self.reserve(values.len(), ctx)?;

        let mut header = self.header();
        // SAFETY: room for values.len() more elements; values is a Rust slice
        // borrowed independently of the fresh storage.
        unsafe {
            ptr::copy(
                values.as_ptr(),
                header.base.element_add::<T>(header.length).cast::<T>(),
                values.len(),
            );
        }
        header.length += values.len();
        self.store(header);
        Ok(())
    }

    /// Makes room for at least `additional` more elements.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if growth fails; the array is left unchanged.
    pub fn reserve<C>(&mut self, additional: usize, ctx: &C) -> Result<()>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let header = self.header();
        let needed = header
            .length
            .checked_add(additional)
            .ok_or(Error::OutOfMemory {
                requested: usize::MAX,
                available: 0,
            })?;
        if needed <= header.capacity {
            return Ok(());
        }
        let grown = needed.max(header.capacity.saturating_mul(2)).max(MIN_CAPACITY);
        self.grow_to(grown, ctx)
    }

    /// Shortens the array to `length` elements. No-op if already shorter.
    pub fn truncate(&mut self, length: usize) {
        let mut header = self.header();
        if length < header.length {
            header.length = length;
            self.store(header);
        }
    }

    /// Removes every element, keeping the capacity.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Borrows the elements as a Rust slice.
    ///
    /// # Safety
    ///
    /// Until the slice is dropped, no copy of this handle may grow, free or
    /// write the array.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[T] {
        let header = self.header();
        if header.length == 0 {
            return &[];
        }
        // SAFETY: base holds `length` initialised elements, kept in place by
        // the caller.
        unsafe { std::slice::from_raw_parts(header.base.cast::<T>(), header.length) }
    }

    /// Mutably borrows the elements as a Rust slice.
    ///
    /// # Safety
    ///
    /// Until the slice is dropped, no copy of this handle may touch the
    /// array at all, reads included.
    #[must_use]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [T] {
        let header = self.header();
        if header.length == 0 {
            return &mut [];
        }
        // SAFETY: as for as_slice; the caller also rules out aliased reads.
        unsafe { std::slice::from_raw_parts_mut(header.base.cast::<T>(), header.length) }
    }

    /// Copies the elements into a `Vec`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        // SAFETY: the view is copied out before anything else can run.
        unsafe { self.as_slice() }.to_vec()
    }

    /// Moves the array out, leaving this handle empty.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Deep copy with its own header and storage.
    ///
    /// Nested handles are copied as handles: inner arrays end up shared.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the copy cannot be reserved.
    pub fn copy<C>(&self, ctx: &C) -> Result<Self>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        if self.is_null() {
            return Ok(Self::default());
        }
        // SAFETY: reserving the copy never moves this array's storage.
        Self::from_slice(ctx, unsafe { self.as_slice() })
    }

    /// Releases the elements and the header. Freeing a null handle is a no-op;
    /// elements that are themselves handles are not freed.
    ///
    /// # Panics
    ///
    /// With misuse checking on, if the array was already freed through
    /// another copy of the handle or belongs to a different context.
    pub fn free<C>(self, ctx: &C)
    where
        C: MemoryContext<'a> + ?Sized,
    {
        if self.is_null() {
            return;
        }
        let header = self.header();
        // Header first, so a double free is reported before touching `base`.
        ctx.release(self.header, HEADER_SIZE);
        if header.base.is_not_null() {
            let bytes = header.capacity * size_of::<T>();
            ctx.release(header.base, bytes);
        }
    }

    /// Calls `f` with every element.
    pub fn iterate(&self, mut f: impl FnMut(T)) {
        self.iterate_index_breakable(|_, value| {
            f(value);
            true
        });
    }

    /// Calls `f` with every index and element.
    pub fn iterate_index(&self, mut f: impl FnMut(usize, T)) {
        self.iterate_index_breakable(|index, value| {
            f(index, value);
            true
        });
    }

    /// Calls `f` with every element until it returns `false`.
    pub fn iterate_breakable(&self, mut f: impl FnMut(T) -> bool) {
        self.iterate_index_breakable(|_, value| f(value));
    }

    /// Calls `f` with every index and element until it returns `false`.
    pub fn iterate_index_breakable(&self, mut f: impl FnMut(usize, T) -> bool) {
        let length = self.len();
        for index in 0..length {
            if !f(index, self.get(index)) {
                break;
            }
        }
    }

    /// Cursor positioned before the first element.
    #[must_use]
    pub fn iter(&self) -> SliceIter<'a, T> {
        SliceIter {
            slice: *self,
            next: 0,
            current: 0,
        }
    }

    /// Start of the element storage, null when nothing is allocated.
    #[inline]
    pub(crate) fn base(&self) -> Pointer {
        self.header().base
    }

    #[inline]
    fn header(&self) -> SliceHeader {
        if self.header.is_null() {
            SliceHeader::EMPTY
        } else {
            // SAFETY: a non-null handle points at a live header.
            unsafe { self.header.read::<SliceHeader>() }
        }
    }

    #[inline]
    fn store(&self, header: SliceHeader) {
        // SAFETY: only called on allocated handles.
        unsafe { self.header.write(header) }
    }

    /// Moves the elements into fresh storage of `capacity` elements.
    ///
    /// New storage is reserved before anything is touched, so a failure
    /// leaves the array as it was.
    fn grow_to<C>(&mut self, capacity: usize, ctx: &C) -> Result<()>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        if self.is_null() {
            *self = Self::with_capacity(ctx, capacity)?;
            return Ok(());
        }

        let bytes = bytes_for::<T>(capacity)?;
        let mut header = self.header();
        let base = ctx.reserve(bytes)?;
        if header.base.is_not_null() {
            // SAFETY: both ranges are live and distinct; length <= old capacity < capacity.
            unsafe {
                ptr::copy_nonoverlapping(header.base.cast::<T>(), base.cast::<T>(), header.length);
            }
            ctx.release(header.base, header.capacity * size_of::<T>());
        }
        header.base = base;
        header.capacity = capacity;
        self.store(header);
        Ok(())
    }
}

/// Cursor over a [`Slice`].
///
/// ```
/// use direx_mem::{Arena, Slice};
/// use direx_mem::config::KB;
///
/// let arena = Arena::new(16 * KB).unwrap();
/// let ctx = arena.local_context();
/// let slice = Slice::from_slice(&ctx, &[10, 20, 30]).unwrap();
///
/// let mut it = slice.iter();
/// while it.advance() {
///     // SAFETY: the array does not grow during the loop.
///     unsafe { *it.value_ref() += it.index() as i32 };
/// }
/// assert_eq!(slice.to_vec(), [10, 21, 32]);
/// slice.free(&ctx);
/// ```
pub struct SliceIter<'a, T: Plain> {
    slice: Slice<'a, T>,
    next: usize,
    current: usize,
}

impl<T: Plain> SliceIter<'_, T> {
    /// Moves to the next element; `false` once past the end.
    pub fn advance(&mut self) -> bool {
        if self.next < self.slice.len() {
            self.current = self.next;
            self.next += 1;
            true
        } else {
            false
        }
    }

    /// Index of the current element.
    #[must_use]
    pub fn index(&self) -> usize {
        self.current
    }

    /// Copy of the current element.
    #[must_use]
    #[track_caller]
    pub fn value(&self) -> T {
        self.slice.get(self.current)
    }

    /// Borrows the current element for in-place mutation.
    ///
    /// # Safety
    ///
    /// As for [`Slice::ref_at`]: no copy of the iterated handle may grow,
    /// free or write the array while the reference is alive.
    #[track_caller]
    pub unsafe fn value_ref(&mut self) -> &mut T {
        // SAFETY: forwarded to the caller.
        unsafe { self.slice.ref_at(self.current) }
    }
}

impl<T: Plain> Iterator for SliceIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.advance().then(|| self.value())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.slice.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl<T: Plain> ExactSizeIterator for SliceIter<'_, T> {}

fn write_elements<T: Plain>(
    slice: &Slice<'_, T>,
    f: &mut fmt::Formatter<'_>,
    mut element: impl FnMut(&T, &mut fmt::Formatter<'_>) -> fmt::Result,
) -> fmt::Result {
    f.write_str("[")?;
    for (i, value) in slice.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        element(&value, f)?;
    }
    f.write_str("]")
}

impl<T: Plain + fmt::Debug> fmt::Debug for Slice<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_elements(self, f, |value, f| write!(f, "{value:?}"))
    }
}

impl<T: Plain + fmt::Display> fmt::Display for Slice<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_elements(self, f, |value, f| write!(f, "{value}"))
    }
}
