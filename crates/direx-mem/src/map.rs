//! Hash maps stored in arena memory.
//!
//! Like [`Slice`], a [`HashMap`] is a one-word handle to a header living in
//! arena memory, so copies of the handle alias one map. Entries sit in a
//! [`Slice`] of slots using open addressing with linear probing. A removed
//! entry leaves a tombstone that keeps collision chains intact until the next
//! rehash; tombstones count towards the 75% load factor.
//!
//! Keys and values are copied in and out. The map never frees them: a map of
//! [`RcString`](crate::RcString) keys must free each key before the map
//! itself is freed.
//!
//! As with [`Slice`], a map handle carries its context's lifetime, and the
//! iterator's reference-returning accessors are `unsafe` because an insert
//! through any copy of the handle may rehash the slots away.

use crate::context::MemoryContext;
use crate::error::Result;
use crate::plain::{Plain, zeroed};
use crate::pointer::Pointer;
use crate::slice::Slice;
use std::fmt;
use std::marker::PhantomData;

/// Slot count of a map created without a size hint.
const MIN_SLOTS: usize = 8;

/// Hashing and equality of map keys.
///
/// Integers hash through `FxHasher`; [`RcString`](crate::RcString) hashes its
/// bytes with 32-bit FNV-1 ([`fnv_hash`](crate::string::fnv_hash)) and
/// compares bytes, not holders.
pub trait KeyHash: Plain {
    fn key_hash(&self) -> u32;

    fn key_eq(&self, other: &Self) -> bool;
}

macro_rules! impl_key_hash {
    ($($ty:ty),* $(,)?) => {
        $(
            impl KeyHash for $ty {
                #[inline]
                fn key_hash(&self) -> u32 {
                    fxhash::hash32(self)
                }

                #[inline]
                fn key_eq(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

impl_key_hash!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, char, bool, Pointer);

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotState {
    Empty = 0,
    Full = 1,
    Tombstone = 2,
}

// SAFETY: discriminant 0 is `Empty`.
unsafe impl Plain for SlotState {}

#[repr(C)]
#[derive(Clone, Copy)]
struct Slot<K, V> {
    state: SlotState,
    hash: u32,
    key: K,
    value: V,
}

// SAFETY: an all-zero slot is an Empty slot over zero-valid key and value.
unsafe impl<K: Plain, V: Plain> Plain for Slot<K, V> {}

#[repr(C)]
#[derive(Clone, Copy)]
struct MapHeader<'a, K: Plain, V: Plain> {
    slots: Slice<'a, Slot<K, V>>,
    /// Full slots.
    len: usize,
    /// Full and tombstone slots.
    used: usize,
}

/// Handle to an open-addressing hash map in arena memory.
///
/// ```
/// use direx_mem::{Arena, HashMap};
/// use direx_mem::config::KB;
///
/// let arena = Arena::new(64 * KB).unwrap();
/// let ctx = arena.local_context();
///
/// let mut ages = HashMap::<u32, u8>::new(0, &ctx).unwrap();
/// ages.put(7, 30, &ctx).unwrap();
/// ages.put(7, 31, &ctx).unwrap();
///
/// assert_eq!(ages.get2(&7), (31, true));
/// assert_eq!(ages.get2(&8), (0, false));
/// assert_eq!(ages.len(), 1);
/// ages.free(&ctx);
/// ```
#[repr(transparent)]
pub struct HashMap<'a, K: KeyHash, V: Plain> {
    header: Pointer,
    _marker: PhantomData<(&'a (), K, V)>,
}

impl<K: KeyHash, V: Plain> Clone for HashMap<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: KeyHash, V: Plain> Copy for HashMap<'_, K, V> {}

impl<K: KeyHash, V: Plain> Default for HashMap<'_, K, V> {
    fn default() -> Self {
        HashMap {
            header: Pointer::null(),
            _marker: PhantomData,
        }
    }
}

// SAFETY: the all-zero handle is the unallocated map.
unsafe impl<K: KeyHash, V: Plain> Plain for HashMap<'_, K, V> {}

impl<'a, K: KeyHash, V: Plain> HashMap<'a, K, V> {
    const HEADER_SIZE: usize = size_of::<MapHeader<'a, K, V>>();

    /// Allocates a map sized for about `capacity_hint` entries.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`](crate::Error::OutOfMemory) if the header or slots
    /// cannot be reserved.
    pub fn new<C>(capacity_hint: usize, ctx: &C) -> Result<Self>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let slots = slots_for(capacity_hint);
        let header = ctx.reserve(Self::HEADER_SIZE)?;
        let slots: Slice<'a, Slot<K, V>> = match Slice::with_length(ctx, slots) {
            Ok(slots) => slots,
            Err(err) => {
                ctx.release(header, Self::HEADER_SIZE);
                return Err(err);
            }
        };

        // SAFETY: header was just reserved with room for a MapHeader.
        unsafe { header.write(MapHeader { slots, len: 0, used: 0 }) };
        Ok(HashMap {
            header,
            _marker: PhantomData,
        })
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.header.is_null()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.header().map_or(0, |h| h.len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.header().map_or(0, |h| h.slots.len())
    }

    /// Looks `key` up, returning the zero value and `false` when absent.
    #[must_use]
    pub fn get2(&self, key: &K) -> (V, bool) {
        match self.get(key) {
            Some(value) => (value, true),
            None => (zeroed(), false),
        }
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let header = self.header()?;
        let index = find(header.slots, key, key.key_hash())?;
        Some(header.slots.get(index).value)
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts `key`, or overwrites the value if an equal key is present
    /// (the stored key is kept).
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`](crate::Error::OutOfMemory) if allocating or
    /// rehashing fails; the map is left unchanged.
    pub fn put<C>(&mut self, key: K, value: V, ctx: &C) -> Result<()>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let hash = key.key_hash();
        if let Some(header) = self.header()
            && let Some(index) = find(header.slots, &key, hash)
        {
            let mut slot = header.slots.get(index);
            slot.value = value;
            header.slots.set(index, slot);
            return Ok(());
        }
        self.insert(Slot { state: SlotState::Full, hash, key, value }, ctx)
    }

    /// Inserts without checking whether `key` is already present.
    ///
    /// Only for keys known to be absent; a duplicate would shadow or be
    /// shadowed by the existing entry.
    ///
    /// # Errors
    ///
    /// As for [`HashMap::put`].
    pub fn direct_put<C>(&mut self, key: K, value: V, ctx: &C) -> Result<()>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let hash = key.key_hash();
        self.insert(Slot { state: SlotState::Full, hash, key, value }, ctx)
    }

    /// Removes `key`, returning the stored key and value so the caller can
    /// free them.
    pub fn remove(&mut self, key: &K) -> Option<(K, V)> {
        let mut header = self.header()?;
        let index = find(header.slots, key, key.key_hash())?;
        let mut slot = header.slots.get(index);
        slot.state = SlotState::Tombstone;
        header.slots.set(index, slot);
        let removed = (slot.key, slot.value);

        header.len -= 1;
        self.store(header);
        Some(removed)
    }

    /// Cursor over the entries, in slot order.
    #[must_use]
    pub fn iter(&self) -> MapIter<'a, K, V> {
        MapIter {
            slots: self.header().map_or_else(Slice::default, |h| h.slots),
            next: 0,
            current: 0,
        }
    }

    /// Releases the slots and the header. Keys and values are not freed.
    pub fn free<C>(self, ctx: &C)
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let Some(header) = self.header() else {
            return;
        };
        ctx.release(self.header, Self::HEADER_SIZE);
        header.slots.free(ctx);
    }

    fn header(&self) -> Option<MapHeader<'a, K, V>> {
        // SAFETY: a non-null handle points at a live header.
        self.header
            .is_not_null()
            .then(|| unsafe { self.header.read::<MapHeader<'a, K, V>>() })
    }

    fn store(&self, header: MapHeader<'a, K, V>) {
        // SAFETY: only called on allocated handles.
        unsafe { self.header.write(header) }
    }

    fn insert<C>(&mut self, slot: Slot<K, V>, ctx: &C) -> Result<()>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        if self.is_null() {
            *self = Self::new(0, ctx)?;
        }
        // SAFETY: the handle is allocated at this point.
        let mut header = unsafe { self.header.read::<MapHeader<'a, K, V>>() };

        let capacity = header.slots.len();
        if (header.used + 1) * 4 > capacity * 3 {
            // Double when live entries dominate, otherwise just sweep tombstones.
            let target = if (header.len + 1) * 2 > capacity { capacity * 2 } else { capacity };
            header = self.rehash(header, target, ctx)?;
        }

        if place(header.slots, slot) {
            header.used += 1;
        }
        header.len += 1;
        self.store(header);
        Ok(())
    }

    fn rehash<C>(
        &self,
        header: MapHeader<'a, K, V>,
        capacity: usize,
        ctx: &C,
    ) -> Result<MapHeader<'a, K, V>>
    where
        C: MemoryContext<'a> + ?Sized,
    {
        let slots = Slice::<'a, Slot<K, V>>::with_length(ctx, capacity)?;
        header.slots.iterate(|slot| {
            if slot.state == SlotState::Full {
                place(slots, slot);
            }
        });
        header.slots.free(ctx);

        let header = MapHeader { slots, len: header.len, used: header.len };
        self.store(header);
        Ok(header)
    }
}

/// Slot count for `hint` entries below the load factor.
fn slots_for(hint: usize) -> usize {
    hint.saturating_mul(4).div_ceil(3).next_power_of_two().max(MIN_SLOTS)
}

fn find<K: KeyHash, V: Plain>(slots: Slice<'_, Slot<K, V>>, key: &K, hash: u32) -> Option<usize> {
    let mask = slots.len() - 1;
    let mut index = hash as usize & mask;
    for _ in 0..slots.len() {
        let slot = slots.get(index);
        match slot.state {
            SlotState::Empty => return None,
            SlotState::Full if slot.hash == hash && slot.key.key_eq(key) => return Some(index),
            _ => {}
        }
        index = (index + 1) & mask;
    }
    None
}

/// Writes `slot` into the first free position of its collision chain. Returns
/// `true` if that position was empty rather than a tombstone.
fn place<K: KeyHash, V: Plain>(slots: Slice<'_, Slot<K, V>>, slot: Slot<K, V>) -> bool {
    let mask = slots.len() - 1;
    let mut index = slot.hash as usize & mask;
    loop {
        let state = slots.get(index).state;
        if state != SlotState::Full {
            slots.set(index, slot);
            return state == SlotState::Empty;
        }
        index = (index + 1) & mask;
    }
}

/// Cursor over a [`HashMap`].
///
/// Freeing string keys before the map, taking each key out of its slot:
///
/// ```
/// use direx_mem::{Arena, HashMap, MemoryContext, RcString};
/// use direx_mem::config::KB;
///
/// let arena = Arena::new(64 * KB).unwrap();
/// let ctx = arena.local_context();
/// let mut lengths = HashMap::<RcString, usize>::new(0, &ctx).unwrap();
/// for word in ["map", "keys"] {
///     let key = RcString::from_bytes(word.as_bytes(), &ctx).unwrap();
///     lengths.put(key, word.len(), &ctx).unwrap();
/// }
///
/// let mut it = lengths.iter();
/// while it.advance() {
///     // SAFETY: the map is freed right after; nothing looks keys up again.
///     unsafe { it.key_ref() }.take().free(&ctx);
/// }
/// lengths.free(&ctx);
/// assert_eq!(ctx.reserved(), 0);
/// ```
pub struct MapIter<'a, K: KeyHash, V: Plain> {
    slots: Slice<'a, Slot<K, V>>,
    next: usize,
    current: usize,
}

impl<K: KeyHash, V: Plain> MapIter<'_, K, V> {
    /// Moves to the next entry; `false` once every slot has been visited.
    pub fn advance(&mut self) -> bool {
        while self.next < self.slots.len() {
            let index = self.next;
            self.next += 1;
            if self.slots.get(index).state == SlotState::Full {
                self.current = index;
                return true;
            }
        }
        false
    }

    #[must_use]
    pub fn key(&self) -> K {
        self.slots.get(self.current).key
    }

    #[must_use]
    pub fn value(&self) -> V {
        self.slots.get(self.current).value
    }

    /// Borrows the current key in its slot, for instance to
    /// [`take`](crate::RcString::take) it out before freeing it.
    ///
    /// # Safety
    ///
    /// No copy of the map handle may insert, remove or free while the
    /// reference is alive. A key changed so that its hash or equality no
    /// longer matches the slot must not be looked up again; the map is only
    /// fit to be iterated or freed afterwards.
    #[must_use]
    pub unsafe fn key_ref(&mut self) -> &mut K {
        // SAFETY: forwarded to the caller.
        unsafe { &mut self.slots.ref_at(self.current).key }
    }

    /// Borrows the current value for in-place mutation.
    ///
    /// # Safety
    ///
    /// No copy of the map handle may insert, remove or free while the
    /// reference is alive.
    pub unsafe fn value_ref(&mut self) -> &mut V {
        // SAFETY: forwarded to the caller.
        unsafe { &mut self.slots.ref_at(self.current).value }
    }
}

impl<K: KeyHash, V: Plain> Iterator for MapIter<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        self.advance().then(|| (self.key(), self.value()))
    }
}

impl<K: KeyHash + fmt::Debug, V: Plain + fmt::Debug> fmt::Debug for HashMap<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
