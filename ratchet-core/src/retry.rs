//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure job retry backoff.
use std::time::Duration;

/// A retry policy to determine how far into the future a failed job's
/// `run_at` is pushed.
///
/// The default schedule is `error_count^4 + 3` seconds, counting the failure
/// being recorded: 4s, 19s, 84s, 259s, ...
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// A fixed interval used for every retry instead of the default schedule.
    pub base_interval: Option<Duration>,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Determine the interval until the next retry of a job that has now
    /// failed `error_count` times.
    pub fn retry_interval(&self, error_count: i32) -> Duration {
        let candidate_interval = match self.base_interval {
            Some(interval) => interval,
            None => {
                let count = u64::try_from(error_count).unwrap_or(0);
                Duration::from_secs(count.saturating_pow(4).saturating_add(3))
            }
        };

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
#[derive(Default)]
pub struct RetryPolicyBuilder {
    pub base_interval: Option<Duration>,
    pub maximum_interval: Option<Duration>,
}

impl RetryPolicyBuilder {
    pub fn base_interval(mut self, interval: Duration) -> RetryPolicyBuilder {
        self.base_interval = Some(interval);
        self
    }

    pub fn maximum_interval(mut self, interval: Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            base_interval: self.base_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_is_quartic() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(19));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(84));
        assert_eq!(retry_policy.retry_interval(4), Duration::from_secs(259));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build()
            .maximum_interval(Duration::from_secs(20))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(19));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(20));
        assert_eq!(retry_policy.retry_interval(100), Duration::from_secs(20));
    }

    #[test]
    fn test_fixed_base_interval() {
        let retry_policy = RetryPolicy::build()
            .base_interval(Duration::from_secs(2))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(5), Duration::from_secs(2));
    }

    #[test]
    fn test_out_of_range_error_count_is_clamped() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(retry_policy.retry_interval(-1), Duration::from_secs(3));
        assert!(retry_policy.retry_interval(i32::MAX) > Duration::from_secs(3));
    }
}
