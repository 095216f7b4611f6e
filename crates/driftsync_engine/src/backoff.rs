//! Backoff policy and retry counting.

use rand::Rng;
use std::time::Duration;

/// A jittered exponential backoff policy.
///
/// The policy is a pure delay computation; it holds no attempt state.
/// Pair it with a [`RetryCounter`] to track attempts against a cutoff.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub base_delay: Duration,
    /// Upper bound on the computed delay (before jitter).
    pub max_delay: Duration,
    /// Proportional jitter added on top, in `0.0..=1.0`.
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    /// Creates a policy with the given base delay and defaults elsewhere.
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Self::default()
        }
    }

    /// Calculates the delay for a given attempt.
    ///
    /// Attempt 0 means "not a retry" and yields zero. Attempt `n` yields
    /// `base * 2^(n-1)` capped at `max_delay`, plus up to
    /// `jitter_ratio` of proportional random jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());

        if self.jitter_ratio > 0.0 {
            let jitter = capped * self.jitter_ratio * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.25,
        }
    }
}

/// Tracks retry attempts against a backoff policy and an optional cutoff.
#[derive(Debug, Clone)]
pub struct RetryCounter {
    policy: BackoffPolicy,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl RetryCounter {
    /// Creates a counter. `max_attempts: None` retries forever.
    pub fn new(policy: BackoffPolicy, max_attempts: Option<u32>) -> Self {
        Self {
            policy,
            max_attempts,
            attempt: 0,
        }
    }

    /// Registers the next attempt and returns its delay, or `None` when
    /// the attempt budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        self.attempt += 1;
        Some(self.policy.delay_for_attempt(self.attempt))
    }

    /// Resets the attempt count to zero.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the number of attempts registered since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, max_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn attempt_zero_is_immediate() {
        let policy = no_jitter(100, 30_000);
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn exponential_growth() {
        let policy = no_jitter(100, 30_000);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn delay_respects_cap() {
        let policy = no_jitter(1_000, 5_000);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.25,
        };

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn counter_exhaustion_and_reset() {
        let mut counter = RetryCounter::new(no_jitter(10, 100), Some(2));

        assert_eq!(counter.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(counter.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(counter.next_delay(), None);
        assert_eq!(counter.attempt(), 2);

        counter.reset();
        assert_eq!(counter.attempt(), 0);
        assert_eq!(counter.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn unlimited_counter_never_exhausts() {
        let mut counter = RetryCounter::new(no_jitter(10, 40), None);
        for _ in 0..20 {
            assert!(counter.next_delay().is_some());
        }
    }
}
