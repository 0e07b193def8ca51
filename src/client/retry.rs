use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::ClientError;

pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Bounded retries with exponential backoff.
///
/// `attempts` counts retries, so a policy with `attempts = 3` makes at most
/// four calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            max_delay: MAX_RETRY_DELAY,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `thunk` until it succeeds, fails with a non-retryable error, or
    /// the attempts are used up. A fresh future is built for every attempt.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut thunk: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut retry = 0;
        loop {
            match thunk().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && retry < self.attempts => {
                    let delay = self.delay_for(retry);
                    warn!(
                        target: "orgmigrate",
                        event = "retrying_operation",
                        operation,
                        attempt = retry + 1,
                        max_attempts = self.attempts + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => {
                    if retry > 0 {
                        warn!(
                            target: "orgmigrate",
                            event = "retries_exhausted",
                            operation,
                            attempts = retry + 1,
                            error = %err
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn throttled() -> ClientError {
        ClientError::Api {
            operation: "list".into(),
            status: 429,
            message: "slow down".into(),
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(9), MAX_RETRY_DELAY);
        assert_eq!(policy.delay_for(u32::MAX), MAX_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_with_fresh_calls() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let value = policy
            .run("op", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(throttled())
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempts_plus_one_calls() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let err = policy
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(throttled())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 429, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let _ = policy
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ClientError::Api {
                    operation: "create".into(),
                    status: 400,
                    message: "bad".into(),
                })
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
