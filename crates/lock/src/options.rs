use std::time::Duration;

/// Refresh cadence is clamped below this fraction of the TTL; refreshing
/// any closer to expiry risks losing the lease to scheduling jitter.
const MAX_REFRESH_RATIO: f64 = 0.9;

/// Options controlling lock acquisition and lease maintenance.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease duration on the lock key.
    pub ttl: Duration,

    /// Maximum time to wait for acquisition. Zero means try once and
    /// surface `AlreadyLocked` on contention.
    pub wait: Duration,

    /// Fraction of `ttl` between refresh calls while the protected work
    /// runs. Values `<= 0` disable refresh; the work is then bounded by a
    /// hard `ttl` deadline instead.
    pub refresh_ratio: f64,

    /// Caller-supplied fencing token. Generated (UUID v7) when `None`.
    pub token: Option<String>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            wait: Duration::from_secs(10),
            refresh_ratio: 0.7,
            token: None,
        }
    }
}

impl LockOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_refresh_ratio(mut self, ratio: f64) -> Self {
        self.refresh_ratio = ratio;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Interval between refresh calls, or `None` when refresh is disabled.
    pub(crate) fn refresh_interval(&self) -> Option<Duration> {
        if self.refresh_ratio <= 0.0 {
            return None;
        }
        Some(self.ttl.mul_f64(self.refresh_ratio.min(MAX_REFRESH_RATIO)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_refresh_interval() {
        let opts = LockOptions::default().with_ttl(Duration::from_secs(10));
        assert_eq!(opts.refresh_interval(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn non_positive_ratio_disables_refresh() {
        let opts = LockOptions::default().with_refresh_ratio(0.0);
        assert_eq!(opts.refresh_interval(), None);
        let opts = LockOptions::default().with_refresh_ratio(-1.0);
        assert_eq!(opts.refresh_interval(), None);
    }

    #[test]
    fn ratio_is_clamped_below_one() {
        let opts = LockOptions::default()
            .with_ttl(Duration::from_secs(10))
            .with_refresh_ratio(2.0);
        assert_eq!(opts.refresh_interval(), Some(Duration::from_secs(9)));
    }
}
