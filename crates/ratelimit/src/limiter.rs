use async_trait::async_trait;

use cordon_core::SyncError;

use crate::decision::Decision;

/// A keyed admission controller.
///
/// `allow*` and `limit*` both consume capacity; they differ only in how
/// much of the outcome they report. Implementations perform exactly one
/// atomic store round trip per call (the token bucket adds one clock
/// read), so concurrent callers anywhere can share a key's budget.
#[async_trait]
pub trait RateLimit: Send + Sync {
    /// Admit `n` units for `key` and report the full decision.
    async fn limit_n(&self, key: &str, n: u64) -> Result<Decision, SyncError>;

    /// Admit one unit for `key` and report the full decision.
    async fn limit(&self, key: &str) -> Result<Decision, SyncError> {
        self.limit_n(key, 1).await
    }

    /// Admit `n` units for `key`; just the verdict.
    async fn allow_n(&self, key: &str, n: u64) -> Result<bool, SyncError> {
        Ok(self.limit_n(key, n).await?.allowed)
    }

    /// Admit one unit for `key`; just the verdict.
    async fn allow(&self, key: &str) -> Result<bool, SyncError> {
        self.allow_n(key, 1).await
    }
}
