use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use cordon_core::SyncError;
use cordon_store::store::SyncStore;

use crate::decision::{Decision, Quota, at};
use crate::limiter::RateLimit;

/// GCRA (Generic Cell Rate Algorithm) rate limiter.
///
/// Tracks one theoretical arrival time per key; an admission is allowed
/// iff `TAT - burst * (period / limit) <= now`, giving a perfectly smooth
/// `limit / period` rate with `burst` early admissions on top. With
/// `burst = 0` this is strict smoothing; there are no window-boundary
/// artifacts.
///
/// All arithmetic runs on the store's clock; the store-relative
/// `retry_in` is applied to the local clock only to render `retry_at`.
pub struct Gcra {
    store: Arc<dyn SyncStore>,
    quota: Quota,
}

impl Gcra {
    pub fn new(store: Arc<dyn SyncStore>, quota: Quota) -> Self {
        Self { store, quota }
    }

    fn state_key(key: &str) -> String {
        format!("{key}:ratelimit:gcra")
    }
}

#[async_trait]
impl RateLimit for Gcra {
    async fn limit_n(&self, key: &str, n: u64) -> Result<Decision, SyncError> {
        if self.quota.limit == 0 || self.quota.period.is_zero() {
            return Err(SyncError::Store("gcra requires a positive limit and period".into()));
        }
        let reply = self
            .store
            .gcra(
                &Self::state_key(key),
                self.quota.burst,
                self.quota.limit,
                self.quota.period,
                n,
            )
            .await?;

        if !reply.allowed {
            debug!(%key, n, retry_in = ?reply.retry_in, "gcra denial");
        }
        let now = Utc::now();
        Ok(Decision {
            allowed: reply.allowed,
            limit: self.quota.limit,
            remaining: reply.remaining,
            retry_at: at(now, reply.retry_in),
            reset_at: at(now, reply.reset_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cordon_store_memory::MemorySyncStore;

    use super::*;

    fn limiter(quota: Quota) -> Gcra {
        Gcra::new(Arc::new(MemorySyncStore::new()), quota)
    }

    /// Probe once every 100ms for a second and record the verdicts.
    async fn probe_pattern(limiter: &Gcra) -> Vec<bool> {
        let mut pattern = Vec::new();
        for _ in 0..10 {
            pattern.push(limiter.allow("U").await.unwrap());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        pattern
    }

    #[tokio::test(start_paused = true)]
    async fn strict_smoothing_alternates() {
        let limiter = limiter(Quota::new(5, Duration::from_secs(1)));

        let pattern = probe_pattern(&limiter).await;
        // 5 per second means one admission per 200ms: every other probe.
        assert_eq!(
            pattern,
            vec![true, false, true, false, true, false, true, false, true, false]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn burst_admits_one_extra() {
        let limiter = limiter(Quota::new(5, Duration::from_secs(1)).with_burst(1));

        let pattern = probe_pattern(&limiter).await;
        let allowed = pattern.iter().filter(|ok| **ok).count();
        assert_eq!(allowed, 6, "limit plus one burst over the second");
        assert!(pattern[0] && pattern[1], "the burst is available up front");
    }

    #[tokio::test(start_paused = true)]
    async fn denial_reports_time_to_conformance() {
        let limiter = limiter(Quota::new(1, Duration::from_secs(1)));

        let first = limiter.limit("U").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);

        let second = limiter.limit("U").await.unwrap();
        assert!(!second.allowed);
        assert!(second.reset_at >= second.retry_at);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_key_recovers_fully() {
        let limiter = limiter(Quota::new(2, Duration::from_secs(1)));

        assert!(limiter.allow_n("U", 2).await.unwrap());
        assert!(!limiter.allow("U").await.unwrap());

        // A full period of silence restores the whole budget.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.allow_n("U", 2).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn quantity_advances_the_schedule_proportionally() {
        let limiter = limiter(Quota::new(10, Duration::from_secs(1)));

        // n = 5 books half the period up front.
        assert!(limiter.allow_n("U", 5).await.unwrap());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(
            !limiter.allow("U").await.unwrap(),
            "only 400ms of the 500ms booking has drained"
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            limiter.allow("U").await.unwrap(),
            "half the budget returns after half the period"
        );
    }
}
