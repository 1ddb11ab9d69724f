//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;

/// Configuration for activity and workflow retries
///
/// A policy bounds the number of attempts and the spacing between them, and
/// names error types that must never be retried.
///
/// # Example
///
/// ```
/// use benchflow_durable::RetryPolicy;
/// use std::time::Duration;
///
/// // Poll every 5 seconds, give up after 72 attempts
/// let policy = RetryPolicy::fixed(Duration::from_secs(5), 72)
///     .with_non_retryable_error("OperationFailed");
///
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
/// assert!(!policy.should_retry(Some("OperationFailed")));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (1.0 for fixed spacing)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0)
    pub jitter: f64,

    /// Error types that are never retried
    #[serde(default)]
    pub non_retryable_error_types: Vec<String>,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the attempt again after `delay`
    Retry { next_attempt: u32, delay: Duration },

    /// The error is classified as permanent
    NonRetryable,

    /// All attempts are used up
    Exhausted,
}

impl RetryDecision {
    pub fn will_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 5 attempts, 1s initial, 60s cap, 2x, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_error_types: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_error_types: vec![],
        }
    }

    /// Create a policy with fixed intervals (no backoff, no jitter)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_error_types: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_error_types.push(error_type.into());
        self
    }

    /// Delay to wait before `attempt` (1-based). The first attempt has none.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if an error type may be retried under this policy
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self
                .non_retryable_error_types
                .iter()
                .any(|t| t == error_type),
            None => true,
        }
    }

    /// Check if there are remaining attempts after `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Decide what happens after `attempt` failed with `error`
    ///
    /// An error is permanent when it is flagged non-retryable itself or its
    /// type is listed in `non_retryable_error_types`.
    pub fn decide(&self, attempt: u32, error: &ActivityError) -> RetryDecision {
        if !error.retryable || !self.should_retry(error.error_type.as_deref()) {
            return RetryDecision::NonRetryable;
        }
        if !self.has_attempts_remaining(attempt) {
            return RetryDecision::Exhausted;
        }
        let next_attempt = attempt + 1;
        RetryDecision::Retry {
            next_attempt,
            delay: self.delay_for_attempt(next_attempt),
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 72);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(72), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(60));
    }

    #[test]
    fn test_non_retryable_error_types() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3)
            .with_non_retryable_error("OperationFailed");

        assert!(!policy.should_retry(Some("OperationFailed")));
        assert!(policy.should_retry(Some("OperationPending")));
        assert!(policy.should_retry(None));
    }

    #[test]
    fn test_decide_retries_until_exhausted() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);
        let error = ActivityError::retryable("not done yet");

        assert_eq!(
            policy.decide(1, &error),
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_secs(5)
            }
        );
        assert!(policy.decide(2, &error).will_retry());
        assert_eq!(policy.decide(3, &error), RetryDecision::Exhausted);
    }

    #[test]
    fn test_decide_short_circuits_permanent_errors() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 72)
            .with_non_retryable_error("OperationFailed");

        let typed = ActivityError::retryable("aborted").with_type("OperationFailed");
        assert_eq!(policy.decide(1, &typed), RetryDecision::NonRetryable);

        let flagged = ActivityError::non_retryable("bad input");
        assert_eq!(policy.decide(1, &flagged), RetryDecision::NonRetryable);
    }

    #[test]
    fn test_serialization_uses_millis() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 36)
            .with_non_retryable_error("OperationFailed");

        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["initial_interval"], 5000);
        assert_eq!(json["non_retryable_error_types"][0], "OperationFailed");

        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(policy, parsed);
    }
}
