//! Activity retry policy with capped exponential backoff.

use std::time::Duration;

/// Resolved retry policy for one activity dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// Total attempts including the first. Zero means unlimited.
    pub maximum_attempts: u32,
    /// Error types that fail immediately regardless of attempts left.
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 5,
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            maximum_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed
    /// with an error of `error_type`.
    pub fn should_retry(&self, attempt: u32, error_type: &str, non_retryable: bool) -> bool {
        if non_retryable || self.non_retryable_error_types.iter().any(|t| t == error_type) {
            return false;
        }
        self.maximum_attempts == 0 || attempt < self.maximum_attempts
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based)
    /// just failed: `initial * coefficient^(attempt-1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        let secs = self.initial_interval.as_secs_f64() * factor;
        let cap = self.maximum_interval.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.maximum_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
