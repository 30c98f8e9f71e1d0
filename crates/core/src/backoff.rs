use std::time::Duration;

use rand::Rng;

/// Strategy producing retry delays for acquisition loops.
///
/// Attempts start at zero. Callers treat the strategy as opaque: they ask
/// for a delay, sleep it, and retry.
pub trait Backoff: Send + Sync {
    /// Delay to sleep before retry number `attempt`.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with full jitter, capped.
///
/// `delay = uniform(0, min(cap, base * 2^attempt))`, floored at one
/// millisecond so retry loops always advance a paused test clock.
#[derive(Debug, Clone)]
pub struct ExponentialJitter {
    base: Duration,
    cap: Duration,
}

impl ExponentialJitter {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl Default for ExponentialJitter {
    fn default() -> Self {
        Self::new(Duration::from_millis(16), Duration::from_secs(1))
    }
}

impl Backoff for ExponentialJitter {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let ceiling = self
            .base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap);
        let upper_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        let ms = rand::thread_rng().gen_range(0..=upper_ms);
        Duration::from_millis(ms.max(1))
    }
}

/// Fixed-interval polling, the strategy to reach for when jitter is
/// undesirable (e.g. tests asserting on timing).
#[derive(Debug, Clone)]
pub struct Constant(pub Duration);

impl Backoff for Constant {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_envelope() {
        let policy = ExponentialJitter::new(Duration::from_millis(10), Duration::from_millis(500));
        for attempt in 0..20 {
            let d = policy.delay(attempt);
            assert!(d >= Duration::from_millis(1));
            assert!(d <= Duration::from_millis(500));
        }
    }

    #[test]
    fn early_attempts_bounded_by_doubling_base() {
        let policy = ExponentialJitter::new(Duration::from_millis(10), Duration::from_secs(10));
        for _ in 0..100 {
            assert!(policy.delay(0) <= Duration::from_millis(10));
            assert!(policy.delay(2) <= Duration::from_millis(40));
        }
    }

    #[test]
    fn huge_attempt_saturates_at_cap() {
        let policy = ExponentialJitter::new(Duration::from_millis(10), Duration::from_millis(200));
        for _ in 0..100 {
            assert!(policy.delay(u32::MAX) <= Duration::from_millis(200));
        }
    }

    #[test]
    fn constant_ignores_attempt() {
        let policy = Constant(Duration::from_millis(50));
        assert_eq!(policy.delay(0), policy.delay(99));
    }
}
