//! Error types for `direx` memory management.
//!
//! Only [`Error::OutOfMemory`] is a recoverable condition; growth failures
//! travel back to the caller through every composing operation and leave the
//! structure being grown untouched. [`Error::CapacityError`] and
//! [`Error::InvalidAlignment`] reject a bad arena configuration at
//! construction time. [`Error::DoubleFree`] and [`Error::BoundsViolation`]
//! describe programming errors: they are never returned, only used as the
//! message of the panic raised when the misuse is detected.

use std::fmt;

/// Errors produced by the arena, its contexts and the containers built on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A reservation could not be satisfied from the remaining capacity.
    OutOfMemory {
        /// Bytes requested (after rounding to the arena alignment).
        requested: usize,
        /// Bytes still unreserved in the arena.
        available: usize,
    },

    /// The arena capacity is zero or too large to lay out.
    CapacityError {
        /// The rejected capacity.
        capacity: usize,
    },

    /// The configured alignment is not a power of two of at least 16.
    InvalidAlignment {
        /// The rejected alignment.
        alignment: usize,
    },

    /// A range was released that is not currently reserved.
    DoubleFree {
        /// Address of the released range.
        addr: usize,
    },

    /// An element index at or past the array length.
    BoundsViolation {
        /// The offending index.
        index: usize,
        /// Length of the array at the time of access.
        length: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory { requested, available } => {
                write!(f, "Out of memory: requested {requested} bytes, available {available} bytes")
            }
            Error::CapacityError { capacity } => {
                write!(f, "Invalid arena capacity: {capacity} bytes")
            }
            Error::InvalidAlignment { alignment } => {
                write!(f, "Invalid alignment: {alignment} is not a power of two >= 16")
            }
            Error::DoubleFree { addr } => {
                write!(f, "Double free: range at {addr:#x} is not reserved")
            }
            Error::BoundsViolation { index, length } => {
                write!(f, "Index out of bounds: index {index}, length {length}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for `direx` memory operations.
pub type Result<T> = std::result::Result<T, Error>;
