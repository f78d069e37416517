//! Exponential backoff with jitter for transient provider errors.
//!
//! `spec.md` §4.1: "Transient errors (rate limits, network, timeouts, 5xx)
//! are retried with exponential backoff + jitter up to a configured attempt
//! cap. Non-transient errors... fail immediately." No new crate is needed
//! for this — `tokio::time::sleep` plus `rand` jitter keeps the dependency
//! stack aligned with the teacher's preference for small, direct
//! implementations over heavyweight retry frameworks.

use std::time::Duration;

use rand::Rng;
use rlm_core::RlmError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
        let capped = exp.min(self.max_delay.as_millis() as u64);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped / 4 + 1);
        Duration::from_millis(capped + jitter_ms)
    }
}

/// Classifies whether an HTTP status code represents a transient failure
/// (rate limit or server error) per `spec.md` §4.1.
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Runs `op` with exponential-backoff-and-jitter retry for transient
/// failures. `classify` decides, from the error, whether a retry is
/// warranted; non-transient errors are returned immediately.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
    classify: impl Fn(&RlmError) -> bool,
) -> Result<T, RlmError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RlmError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if classify(&err) && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(attempt, ?delay, error = %err, "retrying transient backend error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) if classify(&err) => {
                return Err(RlmError::backend_transient_exhausted(err.to_string()));
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn transient_status_classification() {
        assert!(is_transient_status(429));
        assert!(is_transient_status(503));
        assert!(!is_transient_status(404));
        assert!(!is_transient_status(401));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let result: Result<u32, RlmError> = retry_transient(
            &policy,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RlmError::backend("rate limited"))
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_cap() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let result: Result<u32, RlmError> =
            retry_transient(&policy, || async { Err(RlmError::backend("down")) }, |_| true).await;
        assert!(matches!(result, Err(RlmError::BackendTransientExhausted(_))));
    }

    #[tokio::test]
    async fn non_transient_errors_fail_immediately() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, RlmError> = retry_transient(
            &policy,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(RlmError::configuration("bad request")) }
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
