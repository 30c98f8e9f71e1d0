use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by Cordon's synchronization primitives.
///
/// Variants carry rendered strings rather than wrapped source errors so
/// the type stays `Clone`: single-flight followers receive a copy of the
/// leader's outcome. Store backends translate their client errors into
/// [`Connection`](SyncError::Connection) / [`Store`](SyncError::Store) at
/// the boundary; the primitives never see raw client errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A conditional acquire lost the race: the key is held by another token.
    #[error("lock {0} is already held")]
    AlreadyLocked(String),

    /// The acquisition or single-flight wait budget was exhausted.
    #[error("gave up waiting after {0:?}")]
    WaitTimeout(Duration),

    /// The lease disappeared underneath us (TTL reaped or already released).
    #[error("lock {0} expired")]
    LockExpired(String),

    /// The key is present but owned by a different token.
    #[error("lock {0} is held by a different owner")]
    LockMismatch(String),

    /// Ambient cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// Admission denied by a rate limiter.
    #[error("rate limited, retry in {retry_in:?}")]
    RateLimited {
        /// How long until the next admission can succeed.
        retry_in: Duration,
    },

    /// Connection-level failure talking to the store.
    #[error("connection error: {0}")]
    Connection(String),

    /// Command or script failure reported by the store.
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    /// True when the error means ownership of a lease was lost, whether the
    /// key is gone or held by someone else. Callers should treat both the
    /// same way: stop relying on mutual exclusion.
    pub fn is_lost_lease(&self) -> bool {
        matches!(self, Self::LockExpired(_) | Self::LockMismatch(_))
    }

    /// True for transport-level failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_lease_classification() {
        assert!(SyncError::LockExpired("k".into()).is_lost_lease());
        assert!(SyncError::LockMismatch("k".into()).is_lost_lease());
        assert!(!SyncError::AlreadyLocked("k".into()).is_lost_lease());
        assert!(!SyncError::Cancelled.is_lost_lease());
    }

    #[test]
    fn display_includes_key() {
        let err = SyncError::AlreadyLocked("orders:42".into());
        assert!(err.to_string().contains("orders:42"));
    }
}
