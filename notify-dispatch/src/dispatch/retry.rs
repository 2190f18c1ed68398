//! Retry policy with exponential backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::add_std;

/// Exponential backoff policy for failed deliveries.
///
/// Pure: it answers questions about a retry count and never touches a
/// notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry is considered.
    pub base_delay: Duration,
    /// Failed attempts after which a notification is permanently failed.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// `base_delay * 2^retry_count`, saturating.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// No further automatic retries.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }

    /// Earliest retry time after a failure at `last_failure`, or `None` if exhausted.
    pub fn next_eligible_at(
        &self,
        last_failure: DateTime<Utc>,
        retry_count: u32,
    ) -> Option<DateTime<Utc>> {
        if self.is_exhausted(retry_count) {
            return None;
        }
        Some(add_std(last_failure, self.backoff_delay(retry_count)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_doubles() {
        let policy = RetryPolicy::new(Duration::from_secs(300), 3);
        for n in 0..=policy.max_attempts {
            assert_eq!(
                policy.backoff_delay(n),
                Duration::from_secs(300 * 2u64.pow(n)),
                "backoff for n={}",
                n
            );
        }
    }

    #[test]
    fn test_backoff_delay_saturates() {
        let policy = RetryPolicy::new(Duration::from_secs(u64::MAX / 2), 100);
        assert_eq!(policy.backoff_delay(64), Duration::MAX);
        assert_eq!(policy.backoff_delay(3), Duration::MAX);
    }

    #[test]
    fn test_is_exhausted() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn test_next_eligible_at() {
        let policy = RetryPolicy::new(Duration::from_secs(10), 2);
        let t0 = Utc::now();
        assert_eq!(
            policy.next_eligible_at(t0, 1),
            Some(t0 + chrono::Duration::seconds(20))
        );
        assert_eq!(policy.next_eligible_at(t0, 2), None);
    }
}
