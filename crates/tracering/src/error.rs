//! Error types for ring operations.

use thiserror::Error;

/// A push that could not be completed. The rejected item is handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError<T> {
    /// Every slot is occupied.
    #[error("ring buffer is full")]
    Full(T),
    /// The ring has been closed and accepts no more items.
    #[error("ring is closed")]
    Closed(T),
}

impl<T> PushError<T> {
    /// Recovers the rejected item.
    #[inline]
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }

    /// Returns `true` if retrying later may succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// Returns `true` if the ring is permanently unusable.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_error_classification() {
        let full = PushError::Full(7u32);
        assert!(full.is_recoverable());
        assert!(!full.is_terminal());
        assert_eq!(full.to_string(), "ring buffer is full");
        assert_eq!(full.into_inner(), 7);

        let closed = PushError::Closed("span");
        assert!(closed.is_terminal());
        assert_eq!(closed.into_inner(), "span");
    }
}
