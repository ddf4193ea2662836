//! Sizing constants and arena configuration.

use crate::error::{Error, Result};

/// One kibibyte.
pub const KB: usize = 1024;
/// One mebibyte.
pub const MB: usize = 1024 * KB;
/// One gibibyte.
pub const GB: usize = 1024 * MB;

/// Default (and minimum) alignment of every reservation.
///
/// Covers the atomic holder counter, `u64`/`usize` fields of container
/// headers and every primitive element type.
pub const ALIGNMENT: usize = 16;

/// First slab a context requests from its parent.
pub const MIN_SLAB_SIZE: usize = 4 * KB;

/// Slabs double up to this size.
pub const MAX_SLAB_SIZE: usize = 256 * KB;

/// Largest request served from a context's size classes. Anything bigger is
/// a dedicated block taken straight from the parent.
pub const MAX_SMALL_SIZE: usize = 2 * KB;

/// Capacity of a growable array after its first growth.
pub const MIN_CAPACITY: usize = 4;

/// Default slab size of a `StringFactory`.
pub const DEFAULT_STRING_SLAB: usize = 4 * KB;

/// Whether misuse (double free, foreign release, negative holder count) is
/// detected and turned into a panic.
///
/// On under `debug_assertions` or with the `checked` feature. Successful
/// operations behave the same either way.
#[must_use]
pub const fn checked() -> bool {
    cfg!(any(debug_assertions, feature = "checked"))
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline]
pub(crate) const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Construction parameters of an [`Arena`](crate::arena::Arena).
///
/// ```
/// use direx_mem::config::{ArenaConfig, MB};
/// use direx_mem::Arena;
///
/// let arena = Arena::with_config(ArenaConfig::new(MB).alignment(64)).unwrap();
/// assert_eq!(arena.capacity(), MB);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Usable bytes.
    pub capacity: usize,
    /// Alignment of every reservation.
    pub alignment: usize,
}

impl ArenaConfig {
    /// Configuration with the given capacity and the default alignment.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self { capacity, alignment: ALIGNMENT }
    }

    /// Overrides the reservation alignment.
    #[must_use]
    pub const fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.alignment < ALIGNMENT || !self.alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment { alignment: self.alignment });
        }
        if self.capacity == 0
            || self
                .capacity
                .checked_add(2 * self.alignment)
                .is_none_or(|total| total > isize::MAX as usize)
        {
            return Err(Error::CapacityError { capacity: self.capacity });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 16), 32);
    }

    #[test]
    fn test_validate() {
        assert!(ArenaConfig::new(KB).validate().is_ok());
        assert_eq!(
            ArenaConfig::new(0).validate(),
            Err(Error::CapacityError { capacity: 0 })
        );
        assert_eq!(
            ArenaConfig::new(usize::MAX).validate(),
            Err(Error::CapacityError { capacity: usize::MAX })
        );
        assert_eq!(
            ArenaConfig::new(KB).alignment(24).validate(),
            Err(Error::InvalidAlignment { alignment: 24 })
        );
        assert_eq!(
            ArenaConfig::new(KB).alignment(8).validate(),
            Err(Error::InvalidAlignment { alignment: 8 })
        );
    }

    #[test]
    fn test_checked_matches_build() {
        if cfg!(debug_assertions) {
            assert!(checked());
        }
    }
}
