//! Retry policy: exponential backoff with full jitter.
//!
//! Applied only to calls that already passed the circuit breaker. Delay for
//! attempt `n` (0-based) is `base * 2^n` plus uniform jitter in `[0, base)`,
//! capped at `max_delay`. A server-provided retry-after wins outright.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base,
            max_delay,
        }
    }

    /// Delay before retrying `attempt` (0-based count of failures so far).
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(after) = retry_after {
            return after.min(self.max_delay);
        }
        let exp = self
            .base
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(self.max_delay);
        let jitter = jitter_upto(self.base);
        exp.saturating_add(jitter).min(self.max_delay)
    }
}

fn jitter_upto(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let p = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(10));
        for attempt in 0..4u32 {
            let base = Duration::from_millis(100 * 2u64.pow(attempt));
            for _ in 0..20 {
                let d = p.delay(attempt, None);
                assert!(d >= base, "attempt {attempt}: {d:?} < {base:?}");
                assert!(d < base + Duration::from_millis(100));
            }
        }
    }

    #[test]
    fn delay_is_capped() {
        let p = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(p.delay(10, None), Duration::from_millis(500));
    }

    #[test]
    fn retry_after_wins() {
        let p = RetryPolicy::default();
        assert_eq!(
            p.delay(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        // ... but stays bounded by max_delay.
        assert_eq!(p.delay(0, Some(Duration::from_secs(60))), p.max_delay);
    }
}
