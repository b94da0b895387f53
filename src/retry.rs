//! Retry and error recovery utilities
//!
//! Exponential backoff with error classification. Used for storage-conflict
//! retries and for the mandatory refund sequence after a failed mint.

use std::time::Duration;

use eyre::Result;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (timeouts, network, pool exhaustion)
    Transient,
    /// Permanent failure - do not retry (constraint violations, bad input)
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("pool")
        || error_lower.contains("deadlock")
        || error_lower.contains("serialization")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("unique")
        || error_lower.contains("constraint")
        || error_lower.contains("violates")
        || error_lower.contains("invalid")
        || error_lower.contains("not found")
        || error_lower.contains("rejected")
        || error_lower.contains("forbidden")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Execute with retry logic. Permanent errors surface immediately; transient
/// and unknown errors back off exponentially until the attempt budget runs
/// out, then the last error surfaces.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let error_str = e.to_string();
                if classify_error(&error_str) == ErrorClass::Permanent {
                    debug!(error = %error_str, "permanent error, not retrying");
                    return Err(e);
                }
                if !config.should_retry(attempt) {
                    return Err(e);
                }
                let backoff = config.backoff_for_attempt(attempt);
                warn!(
                    attempt,
                    max = config.max_retries,
                    ?backoff,
                    error = %error_str,
                    "retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        };

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(10)); // capped
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(classify_error("deadlock detected"), ErrorClass::Transient);
        assert_eq!(
            classify_error("duplicate key value violates unique constraint"),
            ErrorClass::Permanent
        );
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        };

        let result: Result<u32> = with_retry(&config, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(eyre::eyre!("connection reset by network"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_permanent() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default();

        let result: Result<u32> = with_retry(&config, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(eyre::eyre!("violates unique constraint")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        };

        let result: Result<u32> = with_retry(&config, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(eyre::eyre!("network unreachable")) }
        })
        .await;

        assert!(result.is_err());
        // initial try + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
