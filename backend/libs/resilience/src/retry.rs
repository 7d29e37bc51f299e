use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Classifies whether an error is worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_delay: Duration,
    /// Ceiling for the backoff duration.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Randomize each delay by ±30%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy for transcription/analysis provider calls: 3 attempts on
    /// transport errors, none on validation errors.
    pub fn provider() -> Self {
        Self::default()
    }

    /// Policy for identity-provider JWKS refreshes.
    pub fn jwks() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(250),
            ..Self::default()
        }
    }

    /// A single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Run `f` under the policy. Returns the first success, the first terminal
/// error, or the last error once attempts are exhausted.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut delay = policy.initial_delay;

    for attempt in 1..=policy.max_attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt == policy.max_attempts => {
                warn!(attempt, error = %err, "retries exhausted");
                return Err(err);
            }
            Err(err) => {
                let backoff = apply_jitter(delay, policy.jitter);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(backoff).await;
                delay = Duration::from_millis(
                    ((delay.as_millis() as f64 * policy.multiplier)
                        .min(policy.max_delay.as_millis() as f64)) as u64,
                );
            }
        }
    }

    unreachable!("max_attempts is at least 1")
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32, TestError> = with_retry(&fast_policy(3), move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32, TestError> = with_retry(&fast_policy(3), move || {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError { retryable: true })
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_do_not_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32, TestError> = with_retry(&fast_policy(3), move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { retryable: false }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_on_persistent_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32, TestError> = with_retry(&fast_policy(3), move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { retryable: true }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: false,
            ..RetryPolicy::default()
        };

        let start = std::time::Instant::now();
        let _: Result<u32, TestError> =
            with_retry(&policy, || async { Err(TestError { retryable: true }) }).await;

        // 10ms + 20ms of backoff at minimum.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
