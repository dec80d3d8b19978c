//! Bounded exponential-backoff retry with jitter
//!
//! The executor is generic over the operation's error type; it only consults
//! [`Classify`] to tell transient failures from fatal ones, so the same policy
//! drives source reads and warehouse writes.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Classify, ErrorClass};

/// Default number of attempts, including the first
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Default upper bound for the deterministic delay component
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

pub const DEFAULT_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            multiplier: DEFAULT_MULTIPLIER,
            jitter: true,
        }
    }
}

/// Successful result plus the number of attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Retried<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("Fatal error on attempt {attempt}: {error}")]
    Fatal { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal { attempt, .. } => *attempt,
        }
    }

    pub fn error(&self) -> &E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::Fatal { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::Fatal { error, .. } => error,
        }
    }

    /// Class of the underlying failure; exhausted errors are always retryable ones
    pub fn class(&self) -> ErrorClass {
        match self {
            RetryError::Exhausted { .. } => ErrorClass::Retryable,
            RetryError::Fatal { .. } => ErrorClass::Fatal,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    /// Policy that retries immediately; handy when a caller wants bounded attempts only
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Deterministic delay before retry number `retry` (1 = after the first failure):
    /// `base * multiplier^(retry-1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;

        if !millis.is_finite() || millis >= cap {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// Backoff plus uniformly random jitter in `[0, delay)`
    pub fn delay_with_jitter<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let delay = self.backoff_delay(retry);
        let span = delay.as_millis() as u64;
        if !self.jitter || span == 0 {
            return delay;
        }
        delay + Duration::from_millis(rng.gen_range(0..span))
    }

    /// Run `op` until it succeeds, fails fatally, or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<Retried<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = label, attempt, "Operation succeeded after retry");
                    }
                    return Ok(Retried { value, attempts: attempt });
                },
                Err(error) if error.class() == ErrorClass::Fatal => {
                    warn!(operation = label, attempt, error = %error, "Fatal error, not retrying");
                    return Err(RetryError::Fatal { attempt, error });
                },
                Err(error) => {
                    if attempt >= max_attempts {
                        warn!(
                            operation = label,
                            attempts = attempt,
                            error = %error,
                            "Retry budget exhausted"
                        );
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    let delay = self.delay_with_jitter(attempt, &mut rand::thread_rng());
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(ErrorClass);

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            self.0
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            jitter: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_retryable_attempts_exactly_max() {
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, _> = policy(3)
            .execute("always-fails", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorClass::Retryable))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, _> = policy(5)
            .execute("auth", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorClass::Fatal))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Fatal { attempt: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failure() {
        let result = policy(5)
            .execute("flaky", |attempt| async move {
                if attempt < 3 {
                    Err(TestError(ErrorClass::Retryable))
                } else {
                    Ok(attempt * 10)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, 30);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.retries(), 2);
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let policy = policy(10);
        let delays: Vec<Duration> = (1..=8).map(|r| policy.backoff_delay(r)).collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_one_delay() {
        let policy = policy(10);
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 1..=6 {
            let base = policy.backoff_delay(retry);
            for _ in 0..50 {
                let jittered = policy.delay_with_jitter(retry, &mut rng);
                assert!(jittered >= base);
                assert!(jittered < base * 2);
            }
        }
    }

    #[test]
    fn test_huge_retry_numbers_do_not_overflow() {
        assert_eq!(policy(3).backoff_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_from_config_clamps_attempts() {
        let config = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
