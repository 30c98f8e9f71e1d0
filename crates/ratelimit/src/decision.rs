use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use cordon_core::SyncError;

/// Rate limit parameters: `limit` admissions per `period`, plus an
/// optional `burst` allowance beyond the smooth rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Admissions allowed per period.
    pub limit: u64,
    /// Length of the period.
    pub period: Duration,
    /// Extra admissions allowed beyond the smooth rate (GCRA and token
    /// bucket only; the fixed window ignores it).
    pub burst: u64,
}

impl Quota {
    pub fn new(limit: u64, period: Duration) -> Self {
        Self {
            limit,
            period,
            burst: 0,
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    /// Requests per second implied by this quota, for logs and headers.
    #[allow(clippy::cast_precision_loss)]
    pub fn rate_per_sec(&self) -> f64 {
        if self.period.is_zero() {
            return 0.0;
        }
        self.limit as f64 / self.period.as_secs_f64()
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// The configured limit.
    pub limit: u64,
    /// Admissions left before the next denial.
    pub remaining: u64,
    /// Earliest time the next admission can succeed. The fixed window
    /// reports "now" while allowed; GCRA reports the next conformant
    /// slot even for an allowed request, which callers can use to pace.
    pub retry_at: DateTime<Utc>,
    /// When the consumed capacity is fully restored.
    pub reset_at: DateTime<Utc>,
}

impl Decision {
    /// Time until a retry can succeed, clamped to zero.
    pub fn retry_in(&self) -> Duration {
        (self.retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Time until the consumed capacity is restored, clamped to zero.
    pub fn reset_in(&self) -> Duration {
        (self.reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// The denial as an error, for callers that propagate `Result`.
    pub fn denial(&self) -> Option<SyncError> {
        if self.allowed {
            None
        } else {
            Some(SyncError::RateLimited {
                retry_in: self.retry_in(),
            })
        }
    }
}

/// Convert a store-relative duration into a client-side timestamp.
pub(crate) fn at(now: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    now + TimeDelta::from_std(offset).unwrap_or_else(|_| TimeDelta::zero())
}

/// Convert a store-clock millisecond timestamp into a `DateTime`.
pub(crate) fn at_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_in_clamps_past_timestamps() {
        let decision = Decision {
            allowed: true,
            limit: 10,
            remaining: 9,
            retry_at: Utc::now() - TimeDelta::seconds(5),
            reset_at: Utc::now() - TimeDelta::seconds(5),
        };
        assert_eq!(decision.retry_in(), Duration::ZERO);
        assert_eq!(decision.reset_in(), Duration::ZERO);
    }

    #[test]
    fn retry_in_measures_future_timestamps() {
        let decision = Decision {
            allowed: false,
            limit: 10,
            remaining: 0,
            retry_at: Utc::now() + TimeDelta::seconds(30),
            reset_at: Utc::now() + TimeDelta::seconds(60),
        };
        assert!(decision.retry_in() > Duration::from_secs(29));
        assert!(decision.reset_in() > Duration::from_secs(59));
    }

    #[test]
    fn denial_only_when_denied() {
        let mut decision = Decision {
            allowed: true,
            limit: 1,
            remaining: 0,
            retry_at: Utc::now(),
            reset_at: Utc::now(),
        };
        assert!(decision.denial().is_none());

        decision.allowed = false;
        assert!(matches!(
            decision.denial(),
            Some(SyncError::RateLimited { .. })
        ));
    }

    #[test]
    fn quota_rate() {
        let quota = Quota::new(5, Duration::from_secs(1));
        assert!((quota.rate_per_sec() - 5.0).abs() < f64::EPSILON);
        let quota = Quota::new(5, Duration::ZERO);
        assert!(quota.rate_per_sec().abs() < f64::EPSILON);
    }
}
