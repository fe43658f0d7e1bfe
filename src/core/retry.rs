//! Retry utility for handling transient errors in async operations
//!
//! Provides a configurable retry policy with linear backoff: each failed
//! attempt waits `base_delay * attempt_number` before the next try.

use std::time::Duration;
use tokio::time::sleep;

/// Configurable retry policy for async operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5000),
        }
    }
}

/// Execute an async operation with linear-backoff retry
///
/// Attempt `n` (1-based) that fails waits `base_delay * n` before the next
/// attempt. No delay is taken after the final failure.
pub async fn retry_with_backoff<F, T, E, Fut>(
    operation_name: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                log::warn!(
                    "Operation '{}' failed on attempt {}/{}: {}",
                    operation_name,
                    attempt,
                    policy.max_attempts,
                    error
                );
                last_error = Some(error);
                if attempt < policy.max_attempts {
                    let delay = policy.base_delay * attempt;
                    log::debug!("Retrying '{}' in {:?}", operation_name, delay);
                    sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap())
}
