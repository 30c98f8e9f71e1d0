//! Core building blocks shared across the Cordon workspace.
//!
//! - [`SyncError`]: the single error type every primitive surfaces.
//! - [`Backoff`]: retry-delay strategies for acquisition loops.
//! - [`KeyedMutex`]: a process-local, reference-counted mutex registry
//!   used to collapse local contention before touching the remote store.

pub mod backoff;
pub mod error;
pub mod keyed_mutex;

pub use backoff::{Backoff, Constant, ExponentialJitter};
pub use error::SyncError;
pub use keyed_mutex::{KeyGuard, KeyHandle, KeyedMutex};
