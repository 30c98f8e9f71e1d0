use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use cordon_core::SyncError;
use cordon_store::store::SyncStore;

use crate::decision::{Decision, Quota, at};
use crate::limiter::RateLimit;

/// Token-bucket rate limiter.
///
/// Keeps `{retry_at, count}` per key: `retry_at` is the next scheduled
/// refill instant and `count` the burst capacity spent since the last
/// refill. Admission-equivalent to [`Gcra`](crate::Gcra), but `remaining`
/// reports the unspent burst, which makes the bucket the better fit for
/// surfacing "how much headroom is left" to callers.
pub struct TokenBucket {
    store: Arc<dyn SyncStore>,
    quota: Quota,
}

impl TokenBucket {
    pub fn new(store: Arc<dyn SyncStore>, quota: Quota) -> Self {
        Self { store, quota }
    }

    fn state_key(key: &str) -> String {
        format!("{key}:ratelimit:token_bucket")
    }
}

#[async_trait]
impl RateLimit for TokenBucket {
    async fn limit_n(&self, key: &str, n: u64) -> Result<Decision, SyncError> {
        if self.quota.limit == 0 || self.quota.period.is_zero() {
            return Err(SyncError::Store(
                "token bucket requires a positive limit and period".into(),
            ));
        }
        // The bucket script takes the clock as an argument; read it from
        // the store so every process shares one timeline.
        let now_ms = self.store.now_ms().await?;
        let reply = self
            .store
            .token_bucket(
                &Self::state_key(key),
                self.quota.limit,
                self.quota.period,
                self.quota.burst,
                now_ms,
                n,
            )
            .await?;

        if !reply.allowed {
            debug!(%key, n, retry_in = ?reply.retry_in, "token bucket denial");
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

    fn limiter(quota: Quota) -> TokenBucket {
        TokenBucket::new(Arc::new(MemorySyncStore::new()), quota)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_tops_up_the_smooth_rate() {
        let limiter = limiter(Quota::new(5, Duration::from_secs(1)).with_burst(1));

        let mut allowed = 0;
        for _ in 0..10 {
            if limiter.allow("U").await.unwrap() {
                allowed += 1;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(allowed, 6, "limit plus one burst over the second");
    }

    #[tokio::test(start_paused = true)]
    async fn no_burst_waits_for_refill() {
        let limiter = limiter(Quota::new(1, Duration::from_secs(1)));

        assert!(limiter.allow("U").await.unwrap());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!limiter.allow("U").await.unwrap(), "mid-interval request is denied");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(limiter.allow("U").await.unwrap(), "refill admits again");
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_tracks_unspent_burst() {
        let limiter = limiter(Quota::new(1, Duration::from_secs(1)).with_burst(2));

        let refill = limiter.limit("U").await.unwrap();
        assert!(refill.allowed);
        assert_eq!(refill.remaining, 2, "a refill restores the whole burst");

        let first_burst = limiter.limit("U").await.unwrap();
        assert!(first_burst.allowed);
        assert_eq!(first_burst.remaining, 1);

        let second_burst = limiter.limit("U").await.unwrap();
        assert!(second_burst.allowed);
        assert_eq!(second_burst.remaining, 0);

        let denied = limiter.limit("U").await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_at <= denied.reset_at);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_have_independent_buckets() {
        let limiter = limiter(Quota::new(1, Duration::from_secs(1)));

        assert!(limiter.allow("U").await.unwrap());
        assert!(!limiter.allow("U").await.unwrap());
        assert!(limiter.allow("V").await.unwrap());
    }
}
