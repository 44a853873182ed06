//! Retry schedule for recoverable provider errors.
//!
//! A [`RetryPolicy`] is the configured shape (how many retries, how fast the
//! delay grows); each request gets its own [`Backoff`] built from it.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current_delay: self.initial_delay,
            attempt: 0,
        }
    }
}

/// Delay state for one request. The delay is multiplied after each
/// failure, capped at the policy's `max_delay`.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current_delay: Duration,
    /// Retries handed out so far.
    pub attempt: u32,
}

impl Backoff {
    /// Returns the delay before the next retry, or `None` once the policy's
    /// retries are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.policy.multiplier).min(self.policy.max_delay);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, max_delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(max_delay_ms),
            multiplier: 2,
        }
    }

    #[test]
    fn test_exponential_growth_until_exhausted() {
        let mut b = policy(4, 10_000).backoff();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(800)));
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempt, 4);
    }

    #[test]
    fn test_max_delay_cap() {
        let mut b = policy(5, 250).backoff();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(200)));
        // 200 * 2 = 400, capped at 250
        assert_eq!(b.next_delay(), Some(Duration::from_millis(250)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_no_retries() {
        let mut b = RetryPolicy::no_retries().backoff();
        assert_eq!(b.next_delay(), None);
        assert_eq!(RetryPolicy::default().with_max_retries(7).max_retries, 7);
    }
}
