use std::fmt;

use thiserror::Error;

/// Why an element could not be inserted. The element is always handed back.
#[derive(Error, PartialEq, Eq, Clone, Copy)]
pub enum InsertError<T> {
    /// The queue was at capacity when a non-blocking insert was attempted.
    #[error("queue is full")]
    Full(T),
    /// The queue stayed at capacity until the deadline passed.
    #[error("timed out waiting for free capacity")]
    Timeout(T),
    /// No memory could be obtained for the element's node.
    #[error("failed to allocate a queue node")]
    AllocFailed(T),
}

impl<T> InsertError<T> {
    /// Recover the element that was not inserted.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Timeout(item) | Self::AllocFailed(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_alloc_failed(&self) -> bool {
        matches!(self, Self::AllocFailed(_))
    }
}

// Elements are opaque to the queue, so the element itself is not printed.
impl<T> fmt::Debug for InsertError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Timeout(_) => f.write_str("Timeout(..)"),
            Self::AllocFailed(_) => f.write_str("AllocFailed(..)"),
        }
    }
}
