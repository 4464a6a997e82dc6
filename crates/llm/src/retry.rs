use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::LlmError;

/// Exponential-backoff policy for transient model-server timeouts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (0-based): base, 2×base, 4×base…
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Run `op`, retrying on [`LlmError::Timeout`] with exponential backoff.
///
/// Any other error returns immediately — a malformed response or HTTP error
/// will not get better by retrying.
pub async fn retry_on_timeout<T, F, Fut>(mut op: F, policy: RetryPolicy) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(LlmError::Timeout) if attempt + 1 < attempts => {
                let wait = policy.delay_after(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = attempts,
                    wait_secs = wait.as_secs(),
                    "model call timed out, retrying"
                );
                tokio::time::sleep(wait).await;
            }
            Err(LlmError::Timeout) => {
                error!(max = attempts, "model call exhausted retries");
                return Err(LlmError::Timeout);
            }
            Err(other) => return Err(other),
        }
    }
    unreachable!("retry loop always returns")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result = retry_on_timeout(
            move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, LlmError>("ok")
                }
            },
            policy(),
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_timeouts_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result = retry_on_timeout(
            move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(LlmError::Timeout)
                    } else {
                        Ok("second try".to_string())
                    }
                }
            },
            policy(),
        )
        .await;
        assert_eq!(result.unwrap(), "second try");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<(), _> = retry_on_timeout(
            move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::Timeout)
                }
            },
            policy(),
        )
        .await;
        assert!(matches!(result, Err(LlmError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_timeout_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<(), _> = retry_on_timeout(
            move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::InvalidResponse("bad json".to_string()))
                }
            },
            policy(),
        )
        .await;
        assert!(matches!(result, Err(LlmError::InvalidResponse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
