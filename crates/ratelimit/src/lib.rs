//! Distributed rate limiting over a [`SyncStore`](cordon_store::SyncStore).
//!
//! Three algorithms behind one [`RateLimit`] trait, hot-swappable by
//! callers:
//!
//! - [`FixedWindow`]: one counter per time window. One atomic round trip
//!   per admission; bursts of up to `2 * limit` are possible across a
//!   window boundary.
//! - [`Gcra`]: the Generic Cell Rate Algorithm. Smooths admissions to
//!   `limit / period` with an optional burst allowance; callers needing
//!   strict smoothing pick this one.
//! - [`TokenBucket`]: admission-equivalent to GCRA, with the unspent
//!   burst capacity reported as `remaining`.
//!
//! All admission state lives in the store and all arithmetic runs on the
//! store's clock, so any number of processes share one budget. Store
//! failures surface as errors with the request denied; whether to
//! fail open or fail closed is the caller's policy.

mod decision;
mod fixed_window;
mod gcra;
mod limiter;
mod token_bucket;

pub use decision::{Decision, Quota};
pub use fixed_window::FixedWindow;
pub use gcra::Gcra;
pub use limiter::RateLimit;
pub use token_bucket::TokenBucket;
