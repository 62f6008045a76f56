//! Retry budget and backoff for release jobs.
//!
//! The backoff math is stateless; the attempt counter belongs to exactly one
//! job's retry loop, which owns its own copy of the policy.

use std::time::Duration;

/// Default attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default lower bound between attempts.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Default upper bound between attempts.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential backoff with a bounded attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_backoff: Duration,
    max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0).
    jitter: f64,
    attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

impl RetryPolicy {
    /// Create a policy; `min_backoff` is clamped to `max_backoff`.
    pub fn new(max_attempts: u32, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            min_backoff: min_backoff.min(max_backoff),
            max_backoff,
            jitter: 0.2,
            attempts: 0,
        }
    }

    /// Override the jitter factor.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once the budget
    /// is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.is_exhausted() {
            return None;
        }
        Some(self.delay(self.attempts - 1))
    }

    /// Calculate the delay after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.min_backoff.as_millis() as f64;
        let max = self.max_backoff.as_millis() as f64;
        let delay = (base * 2.0_f64.powi(attempt.min(31) as i32)).min(max);

        let spread = delay * self.jitter;
        let jittered = delay + (rand::random::<f64>() * 2.0 - 1.0) * spread;
        let bounded = jittered.clamp(base, max);

        Duration::from_millis(bounded as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.0);

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(2));
        for attempt in 0..8 {
            let d = policy.delay(attempt);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));

        assert!(policy.record_failure().is_some());
        assert!(policy.record_failure().is_some());
        assert!(policy.record_failure().is_none());
        assert!(policy.is_exhausted());
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn test_min_clamped_to_max() {
        let policy = RetryPolicy::new(1, Duration::from_secs(10), Duration::from_secs(1))
            .with_jitter(0.0);
        assert_eq!(policy.delay(0), Duration::from_secs(1));
    }
}
