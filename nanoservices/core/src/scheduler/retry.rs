use std::time::Duration;

use eltflow_utils::error::Error;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// How many times a node is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed,
            base_delay: Duration::from_secs(300),
            max_delay: Duration::from_secs(3600),
        }
    }

    /// `retries` extra attempts after the first, `delay` apart.
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff: Backoff::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// `retries` extra attempts, doubling from `base_delay`.
    pub fn exponential(retries: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff: Backoff::Exponential,
            base_delay,
            max_delay: Duration::from_secs(3600),
        }
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let exp = attempt.saturating_sub(1).min(31);
                self.base_delay
                    .checked_mul(1u32 << exp)
                    .unwrap_or(self.max_delay)
            }
        };
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32, err: &Error) -> bool {
        attempt < self.max_attempts.max(1) && err.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_single_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1, &Error::task("boom")));
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(10)).max_delay(Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3), Duration::from_secs(40));
        assert_eq!(policy.delay_for(4), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(2, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1), policy.delay_for(2));
    }

    #[test]
    fn non_retryable_errors_stop_immediately() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        assert!(policy.should_retry(1, &Error::connector("api", "503")));
        assert!(!policy.should_retry(4, &Error::connector("api", "503")));
        assert!(!policy.should_retry(1, &Error::Cancelled));
    }
}
