//! Redis backend for Cordon.
//!
//! Implements [`SyncStore`](cordon_store::SyncStore) against a single
//! Redis instance. Every compare-and-act operation runs as one Lua
//! script, so concurrent admissions and lease operations against the same
//! key cannot interleave. Admission arithmetic uses the server's `TIME`,
//! never the client clock.
//!
//! # Consistency
//!
//! A single Redis instance gives full mutual exclusion for locks, as long
//! as the lease TTL outlives the critical section. Under Sentinel or
//! Cluster failover, asynchronous replication can lose a freshly acquired
//! lock key; do not use this backend where a rare duplicate execution
//! during failover is unacceptable.
//!
//! # Example
//!
//! ```ignore
//! use cordon_store_redis::{RedisConfig, RedisSyncStore};
//!
//! let config = RedisConfig::new("redis://localhost:6379");
//! let store = RedisSyncStore::new(&config)?;
//! ```

mod config;
mod scripts;
mod store;

pub use config::RedisConfig;
pub use store::RedisSyncStore;
