//! Fenced distributed lock over a [`SyncStore`](cordon_store::SyncStore).
//!
//! A lock is a key holding an opaque fencing token with a TTL. Release
//! and extension are compare-and-act against the token, executed
//! atomically by the store, so a holder whose lease expired cannot stomp
//! on the next holder.
//!
//! [`Locker::with_lock`] is the high-level entry point: it serializes
//! local callers through a keyed mutex, acquires with backoff (optionally
//! woken early by the release notification of the previous holder), runs
//! the protected work under automatic lease refresh, and releases on
//! every exit path.

mod locker;
mod options;

pub use locker::{Lease, Locker};
pub use options::LockOptions;
