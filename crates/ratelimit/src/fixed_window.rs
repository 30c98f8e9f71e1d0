use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use cordon_core::SyncError;
use cordon_store::store::SyncStore;

use crate::decision::{Decision, Quota, at_ms};
use crate::limiter::RateLimit;

/// Fixed-window rate limiter.
///
/// Admissions are counted per `[window_start, window_start + period)`
/// bucket; the counter key embeds the window start and disappears with
/// the window. Simple and one round trip per check, at the cost of
/// permitting up to `2 * limit` admissions inside any `2 * period` span
/// straddling a boundary.
pub struct FixedWindow {
    store: Arc<dyn SyncStore>,
    quota: Quota,
}

impl FixedWindow {
    pub fn new(store: Arc<dyn SyncStore>, quota: Quota) -> Self {
        Self { store, quota }
    }

    fn window_key(key: &str, window_start_ms: i64) -> String {
        format!("{key}:ratelimit:fixed_window:{window_start_ms}")
    }
}

#[async_trait]
impl RateLimit for FixedWindow {
    async fn limit_n(&self, key: &str, n: u64) -> Result<Decision, SyncError> {
        if self.quota.period.is_zero() {
            return Err(SyncError::Store("fixed window period must be positive".into()));
        }
        let period_ms = i64::try_from(self.quota.period.as_millis()).unwrap_or(i64::MAX);
        let now_ms = self.store.now_ms().await?;
        let window_start = now_ms - now_ms.rem_euclid(period_ms);

        let reply = self
            .store
            .fixed_window(
                &Self::window_key(key, window_start),
                self.quota.limit,
                self.quota.period,
                n,
            )
            .await?;

        if !reply.allowed {
            debug!(%key, n, "fixed window denial");
        }
        Ok(Decision {
            allowed: reply.allowed,
            limit: self.quota.limit,
            remaining: reply.remaining,
            retry_at: at_ms(reply.retry_at_ms),
            reset_at: at_ms(reply.reset_at_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cordon_store_memory::MemorySyncStore;

    use super::*;

    fn limiter(quota: Quota) -> FixedWindow {
        FixedWindow::new(Arc::new(MemorySyncStore::new()), quota)
    }

    #[tokio::test(start_paused = true)]
    async fn admits_exactly_the_limit_within_one_window() {
        let limiter = limiter(Quota::new(5, Duration::from_secs(1)));

        let mut allowed = 0;
        for _ in 0..1000 {
            if limiter.allow("U").await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_window_restores_the_budget() {
        let limiter = limiter(Quota::new(2, Duration::from_secs(1)));

        assert!(limiter.allow("U").await.unwrap());
        assert!(limiter.allow("U").await.unwrap());
        assert!(!limiter.allow("U").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.allow("U").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn quantities_consume_proportionally() {
        let limiter = limiter(Quota::new(5, Duration::from_secs(1)));

        assert!(limiter.allow_n("U", 3).await.unwrap());
        let decision = limiter.limit_n("U", 3).await.unwrap();
        assert!(!decision.allowed, "3 + 3 exceeds a limit of 5");
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn denial_reports_window_reset() {
        let limiter = limiter(Quota::new(1, Duration::from_secs(1)));

        let first = limiter.limit("U").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);

        let second = limiter.limit("U").await.unwrap();
        assert!(!second.allowed);
        assert_eq!(
            second.retry_at, second.reset_at,
            "a denied call can only retry at the window boundary"
        );
        assert!(second.reset_at >= first.reset_at);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_have_independent_budgets() {
        let limiter = limiter(Quota::new(1, Duration::from_secs(1)));

        assert!(limiter.allow("U").await.unwrap());
        assert!(!limiter.allow("U").await.unwrap());
        assert!(limiter.allow("V").await.unwrap(), "V has its own window");
    }
}
