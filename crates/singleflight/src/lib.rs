//! Cross-process single-flight execution.
//!
//! A [`Group`] ensures that at most one caller — across every process
//! sharing the store — executes an identified operation, while all
//! concurrent peers either wait for its completion or time out.
//!
//! Deduplication is layered: tasks inside one process share a deferred
//! result through the group's call table, so only one of them goes to the
//! remote layer; across processes, the lock key's existence marks work in
//! progress, and its release (plus the pub/sub notification) marks
//! completion.
//!
//! [`Group::load_or_store`] builds the common cache-fill pattern on top:
//! read a data key, single-flight the fetch on a miss, write the result
//! back with a TTL.

mod cache;
mod group;

pub use group::{Group, GroupOptions, Outcome};
