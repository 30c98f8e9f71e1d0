use std::time::Duration;

use async_trait::async_trait;

use cordon_core::SyncError;

use crate::pubsub::Subscription;

/// Outcome of a compare-and-act lease operation (release or extend).
///
/// Backends must distinguish a vanished key from one held by another
/// token; callers map the two to different error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// The stored token matched and the operation was applied.
    Ok,
    /// The key was absent: the lease expired or was already released.
    Missing,
    /// The key is present but stores a different token.
    Mismatch,
}

/// Reply from the fixed-window admission operation.
///
/// Timestamps are milliseconds since epoch on the store's clock.
#[derive(Debug, Clone, Copy)]
pub struct WindowReply {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_at_ms: i64,
    pub reset_at_ms: i64,
}

/// Reply from the GCRA and token-bucket admission operations.
///
/// Durations are store-relative: a caller that sleeps `retry_in` before
/// retrying is immune to clock skew between itself and the store.
#[derive(Debug, Clone, Copy)]
pub struct RateReply {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_in: Duration,
    pub reset_in: Duration,
}

/// Shared key-value store with the atomic operations Cordon builds on.
///
/// Every method that reads *and* writes under one key (`acquire`,
/// `release`, `extend`, and the three admission operations) must execute
/// as a single atomic step against the store. A read-then-write
/// implementation is incorrect: a lease can expire and be re-acquired by
/// another holder between the check and the write.
///
/// Implementations must be safe for concurrent use behind an `Arc`.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Set `key` to `token` with `ttl`, only if the key is absent
    /// (`SET NX PX`). Returns whether the key was set.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, SyncError>;

    /// Delete `key` iff its stored value equals `token`.
    async fn release(&self, key: &str, token: &str) -> Result<LeaseStatus, SyncError>;

    /// Reset `key`'s TTL to `ttl` iff its stored value equals `token`.
    async fn extend(&self, key: &str, token: &str, ttl: Duration)
    -> Result<LeaseStatus, SyncError>;

    /// Read a plain value.
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError>;

    /// Write a plain value, with an optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), SyncError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, SyncError>;

    /// Remaining TTL of `key`, `None` when the key is absent or has no
    /// expiry.
    async fn pttl(&self, key: &str) -> Result<Option<Duration>, SyncError>;

    /// Store clock, in milliseconds since its epoch. All admission
    /// arithmetic uses this clock, never the client's.
    async fn now_ms(&self) -> Result<i64, SyncError>;

    /// Fixed-window admission: increment the window counter by `n` (the
    /// first increment arms the window TTL) and allow iff the counter is
    /// within `limit`.
    async fn fixed_window(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
        n: u64,
    ) -> Result<WindowReply, SyncError>;

    /// GCRA admission against the stored theoretical arrival time.
    /// Allows iff `TAT - burst * (period / limit) <= now`, advancing the
    /// TAT by `n * (period / limit)` on admission.
    async fn gcra(
        &self,
        key: &str,
        burst: u64,
        limit: u64,
        period: Duration,
        n: u64,
    ) -> Result<RateReply, SyncError>;

    /// Token-bucket admission over a `{retry_at, count}` pair. `now_ms`
    /// is caller-supplied and should come from [`SyncStore::now_ms`] so
    /// the arithmetic stays on the store clock.
    async fn token_bucket(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
        burst: u64,
        now_ms: i64,
        n: u64,
    ) -> Result<RateReply, SyncError>;

    /// Publish `payload` on `channel`. Fire-and-forget: delivery to zero
    /// subscribers is not an error.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SyncError>;

    /// Subscribe to `channel`. Messages published after this call returns
    /// are delivered to the subscription until it is dropped.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, SyncError>;
}
