//! In-memory [`SyncStore`](cordon_store::SyncStore) backend.
//!
//! Entry expiry is lazy: expired entries are evicted on the next touch of
//! the same key. The store clock is `tokio::time::Instant`-based, so
//! tests running under a paused runtime get fully deterministic admission
//! arithmetic.
//!
//! Useful for tests and for single-process deployments that want the
//! Cordon API without a Redis dependency; it provides no cross-process
//! coordination.

mod store;

pub use store::MemorySyncStore;
