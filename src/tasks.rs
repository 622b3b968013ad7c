//! Background task execution
//!
//! Retry behavior lives in an explicit [`RetryPolicy`] value handed to a
//! generic executor, decoupled from each handler's business logic. Only
//! the executor decides retry vs terminal, based on the error kind.

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// Retry policy with quadratic backoff.
///
/// The default shape waits `attempt² × base` between attempts: with the
/// production base of 60 seconds that is 1, 4, and 9 minutes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base unit of the backoff curve.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before the given retry (1-indexed: `attempt` is the number of
    /// attempts already made).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_mul(attempt))
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug)]
pub struct RetryFailure {
    /// Attempts made before giving up.
    pub attempts: u32,
    pub last_error: AppError,
}

/// Run a fallible async operation under a retry policy.
///
/// Retries only errors classified retryable by the taxonomy
/// ([`AppError::is_retryable`]); terminal errors end the loop immediately.
/// Sleeps the policy's delay between attempts.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<(T, u32), RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => {
                if !error.is_retryable() || !policy.should_retry(attempt) {
                    return Err(RetryFailure {
                        attempts: attempt,
                        last_error: error,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn backoff_curve_is_quadratic_in_the_attempt_number() {
        let policy = RetryPolicy::new(3, Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(540));
    }

    #[test]
    fn should_retry_respects_attempt_cap() {
        let policy = RetryPolicy::new(3, Duration::from_secs(60));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn run_with_retry_retries_network_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();

        let result = run_with_retry(&fast_policy(3), move || {
            let calls = calls_in_op.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::Network("unreachable".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        let (value, attempts) = result.expect("third attempt succeeds");
        assert_eq!(value, 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn run_with_retry_stops_immediately_on_terminal_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();

        let result: Result<((), u32), _> = run_with_retry(&fast_policy(3), move || {
            let calls = calls_in_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Validation("bad payload".to_string()))
            }
        })
        .await;

        let failure = result.expect_err("terminal error must not retry");
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_with_retry_exhausts_the_attempt_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();

        let result: Result<((), u32), _> = run_with_retry(&fast_policy(3), move || {
            let calls = calls_in_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Network("refused".to_string()))
            }
        })
        .await;

        let failure = result.expect_err("all attempts fail");
        assert_eq!(failure.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(failure.last_error.is_retryable());
    }
}
