//! Store abstraction for Cordon's synchronization primitives.
//!
//! This crate defines the [`SyncStore`] trait: the algorithm-level
//! contract every backend must implement atomically per key. The lock,
//! single-flight, and rate-limit crates are written against
//! `Arc<dyn SyncStore>` and never talk to a concrete store directly.
//!
//! Backends provide the atomicity however their store allows — Lua
//! scripts on Redis, per-entry critical sections in memory — and
//! self-certify with the [`testing`] conformance suite.

pub mod pubsub;
pub mod store;
pub mod testing;

pub use pubsub::{DONE, Subscription};
pub use store::{LeaseStatus, RateReply, SyncStore, WindowReply};
