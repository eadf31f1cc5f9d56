//! Retry policy for the processing worker.

use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the business processing step.
///
/// The worker's retry decision is a pure function of the variant.
/// Classification happens where the error originates (the processing step
/// itself), never by inspecting message strings.
#[derive(Debug, Clone, Error)]
pub enum ProcessingError {
    /// Transient failure: timeouts, connectivity, remote 5xx, resource
    /// contention. Worth retrying with backoff.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure: malformed data or a business-rule rejection.
    /// Retrying cannot succeed.
    #[error("{0}")]
    NonRetryable(String),
}

impl ProcessingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingError::Retryable(_))
    }
}

/// Bounded exponential backoff: `delay = min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` failed deliveries
    /// (0-indexed: the first retry waits the base delay).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        };

        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_is_capped_at_max_delay() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        };

        assert_eq!(policy.backoff_delay(4), Duration::from_secs(16));
        assert_eq!(policy.backoff_delay(9), Duration::from_secs(16));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(16));
    }

    #[test]
    fn test_classification_is_a_function_of_the_variant() {
        assert!(ProcessingError::Retryable("connection reset".to_string()).is_retryable());
        assert!(!ProcessingError::NonRetryable("invalid posting".to_string()).is_retryable());
    }
}
