//! Error types for ripple collections and operators.

use thiserror::Error;

/// Result type alias for ripple operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised by collections and derived operators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An index or range does not fit the current collection bounds.
    #[error("index {index} is out of range for length {len}")]
    OutOfRange { index: usize, len: usize },

    /// The arguments of a call break a structural rule (duplicate indices, empty range).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The operator was disposed before the call could complete.
    #[error("operation cancelled: operator disposed")]
    Cancelled,

    /// An operator's shadow state no longer agrees with its output.
    #[error("stale operator state: {0}")]
    StaleState(String),
}

impl Error {
    /// Creates an out-of-range error.
    #[inline]
    pub fn out_of_range(index: usize, len: usize) -> Self {
        Error::OutOfRange { index, len }
    }

    /// Creates an invariant violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Error::InvariantViolation(message.into())
    }

    /// Creates a stale state error.
    pub fn stale(message: impl Into<String>) -> Self {
        Error::StaleState(message.into())
    }

    /// Returns true for the teardown signal, which callers treat as a silent stop.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
