//! Bounded retries with backoff for transient registry failures.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::AuditError;

/// Errors that can tell whether trying again might help.
pub trait Retryable {
    /// Timeouts, connection failures, 429 and 5xx responses.
    fn is_transient(&self) -> bool;

    /// A server-requested minimum wait before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Delay schedule: attempt number (1-based, the attempt that just failed) to wait.
type DelayFn = dyn Fn(u32) -> Duration + Send + Sync;

/// How many times to attempt an operation and how long to wait in between.
///
/// `max_attempts` counts the first attempt, so `max_attempts = 3` means one
/// try plus up to two retries.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Arc<DelayFn>,
}

/// The final error from an operation together with how many attempts were made.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

impl<E: Retryable + fmt::Display> RetryError<E> {
    /// Classify for the audit record: transient exhaustion vs. a definitive
    /// registry failure.
    pub fn into_audit_error(self, operation: &str) -> AuditError {
        if self.last.is_transient() {
            AuditError::TransientNetwork {
                operation: operation.to_string(),
                attempts: self.attempts,
                message: self.last.to_string(),
            }
        } else {
            AuditError::Registry {
                operation: operation.to_string(),
                message: self.last.to_string(),
            }
        }
    }
}

impl RetryPolicy {
    /// A policy with a custom delay schedule.
    pub fn new(
        max_attempts: u32,
        delay: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Arc::new(delay),
        }
    }

    /// Exponential backoff from `base`, doubling per attempt, with ±25%
    /// jitter, capped at `cap`.
    pub fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self::new(max_attempts, move |attempt| {
            let exp = attempt.saturating_sub(1).min(16);
            let delay = base.saturating_mul(1u32 << exp).min(cap);
            let jitter = 0.75 + fastrand::f64() * 0.5;
            delay.mul_f64(jitter).min(cap)
        })
    }

    /// Retry without waiting. Used by tests and offline runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, |_| Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        (self.delay)(attempt)
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or `max_attempts` is exhausted.
    ///
    /// The operation receives the 1-based attempt number. A server-requested
    /// `Retry-After` extends the scheduled delay, never shortens it.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryError<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self
                        .delay_for(attempt)
                        .max(err.retry_after().unwrap_or_default());
                    tracing::debug!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::warn!(operation = label, attempts = attempt, error = %err, "retries exhausted");
                    }
                    return Err(RetryError {
                        attempts: attempt,
                        last: err,
                    });
                }
            }
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("first_delay", &self.delay_for(1))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Flaky,
        Throttled(Duration),
        Fatal,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_transient(&self) -> bool {
            !matches!(self, TestError::Fatal)
        }

        fn retry_after(&self) -> Option<Duration> {
            match self {
                TestError::Throttled(d) => Some(*d),
                _ => None,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("op", |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(3)
            .run("op", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("op", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            })
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_extends_delay() {
        let start = tokio::time::Instant::now();
        let calls = AtomicU32::new(0);
        let _ = RetryPolicy::immediate(2)
            .run("op", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Throttled(Duration::from_secs(7)))
            })
            .await;
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(500), Duration::from_secs(8));
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(375) && first <= Duration::from_millis(625));
        assert!(policy.delay_for(12) <= Duration::from_secs(8));
    }

    #[test]
    fn max_attempts_at_least_one() {
        assert_eq!(RetryPolicy::immediate(0).max_attempts(), 1);
    }

    #[test]
    fn into_audit_error_classifies() {
        let transient = RetryError {
            attempts: 3,
            last: TestError::Flaky,
        }
        .into_audit_error("lookup");
        assert!(matches!(
            transient,
            AuditError::TransientNetwork { attempts: 3, .. }
        ));

        let fatal = RetryError {
            attempts: 1,
            last: TestError::Fatal,
        }
        .into_audit_error("lookup");
        assert!(matches!(fatal, AuditError::Registry { .. }));
    }
}
