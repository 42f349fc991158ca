//! Retry policy: exponential backoff with jitter for `THROTTLED` errors.
//! Throttling is retried distinctly from timeouts — this policy only
//! governs the throttle path.

use std::time::Duration;

use rand::Rng;

use super::config::RetryConfig;

/// Whether an operation's failure should be retried, and under what
/// backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableError {
    Throttled,
    Transient,
    Fatal,
}

/// Drives the retry loop for a single logical operation.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// The delay to use before attempt number `attempt` (1-indexed: the
    /// delay before the *second* attempt is `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let base_ms = self.config.base_delay.as_millis() as f64 * exp;
        let capped_ms = base_ms.min(self.config.max_delay.as_millis() as f64);

        let jittered_ms = if self.config.jitter {
            let mut rng = rand::rng();
            let factor: f64 = rng.random_range(0.5..=1.0);
            capped_ms * factor
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms.round() as u64)
    }

    /// Run `op` up to `max_attempts` times, sleeping `delay_for` between
    /// attempts, as long as it keeps returning `RetryableError::Throttled`
    /// or `Transient`. Returns the last error once attempts are exhausted.
    pub async fn run<T, E, F, Fut>(&self, classify: impl Fn(&E) -> RetryableError, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let kind = classify(&e);
                    if kind == RetryableError::Fatal || attempt >= self.config.max_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let policy = RetryPolicy::new(config);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let policy = RetryPolicy::new(config);
        assert_eq!(policy.delay_for(5), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn retries_throttled_up_to_max_attempts_then_fails() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 1.0,
            jitter: false,
        };
        let policy = RetryPolicy::new(config);
        let calls = AtomicU32::new(0);

        let result: Result<(), &str> = policy
            .run(
                |_e: &&str| RetryableError::Throttled,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("throttled") }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_stop_retrying_immediately() {
        let policy = RetryPolicy::new(RetryConfig::default());
        let calls = AtomicU32::new(0);

        let result: Result<(), &str> = policy
            .run(
                |_e: &&str| RetryableError::Fatal,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("auth failure") }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_retry() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 1.0,
            jitter: false,
        });
        let calls = AtomicU32::new(0);

        let result: Result<&str, &str> = policy
            .run(
                |_e: &&str| RetryableError::Transient,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err("not yet")
                        } else {
                            Ok("done")
                        }
                    }
                },
            )
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
