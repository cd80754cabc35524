use crate::core::errors::ConfigError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry with deterministic exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff_factor: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_attempts must be >= 1".to_string(),
            ));
        }
        if !backoff_factor.is_finite() || backoff_factor < 1.0 {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "backoff_factor must be a finite value >= 1.0, got {}",
                backoff_factor
            )));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            backoff_factor,
        })
    }

    /// Single attempt, no retry
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept after the failed attempt `attempt` (0-indexed): `base × factor^attempt`
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        self.base_delay.mul_f64(self.backoff_factor.powi(exponent))
    }
}

/// Information handed to the before-retry hook
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// Index of the attempt that just failed (0-indexed)
    pub attempt: u32,
    /// Delay before the next attempt starts
    pub delay: Duration,
    pub error: &'a E,
}

/// Runs an operation under a [`RetryPolicy`].
///
/// Every error is retried until the budget is spent; deciding that an error is
/// fatal is up to the caller. Attempts of one operation are strictly sequential.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op`, retrying failures and returning the last error once attempts are exhausted
    pub async fn run<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_with_hook(op, |_attempt: &RetryAttempt<'_, E>| Ok(())).await
    }

    /// Like [`run`](Self::run), calling `before_retry` ahead of each backoff sleep.
    ///
    /// The hook is for observability only: its errors are logged and dropped.
    pub async fn run_with_hook<F, Fut, T, E, H>(&self, mut op: F, mut before_retry: H) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        H: FnMut(&RetryAttempt<'_, E>) -> anyhow::Result<()>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0;

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt + 1 >= max_attempts {
                if max_attempts > 1 {
                    warn!("Giving up after {} attempts: {}", max_attempts, error);
                }
                return Err(error);
            }

            let delay = self.policy.delay_after_attempt(attempt);
            warn!(
                "Attempt {}/{} failed, retrying in {:?}: {}",
                attempt + 1,
                max_attempts,
                delay,
                error
            );

            let hook_result = before_retry(&RetryAttempt {
                attempt,
                delay,
                error: &error,
            });
            if let Err(hook_err) = hook_result {
                debug!("Retry hook failed (ignored): {:#}", hook_err);
            }

            drop(error);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy(max_attempts: u32, base_ms: u64, factor: f64) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(base_ms), factor).unwrap()
    }

    #[test]
    fn test_delay_schedule() {
        let p = policy(4, 500, 2.0);
        assert_eq!(p.delay_after_attempt(0), Duration::from_millis(500));
        assert_eq!(p.delay_after_attempt(1), Duration::from_millis(1000));
        assert_eq!(p.delay_after_attempt(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        assert!(RetryPolicy::new(0, Duration::from_millis(10), 2.0).is_err());
        assert!(RetryPolicy::new(3, Duration::from_millis(10), 0.5).is_err());
        assert!(RetryPolicy::new(3, Duration::from_millis(10), f64::NAN).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_task_exhausts_budget() {
        let executor = RetryExecutor::new(policy(3, 500, 2.0));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), String> = executor
            .run(|| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err(format!("failure #{}", n))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err(), "failure #2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_exact() {
        let executor = RetryExecutor::new(policy(4, 500, 2.0));
        let started = Instant::now();
        let mut starts = Vec::new();

        let _: Result<(), &str> = executor
            .run(|| {
                starts.push(started.elapsed());
                async { Err("nope") }
            })
            .await;

        assert_eq!(
            starts,
            vec![
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_millis(1500),
                Duration::from_millis(3500),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_does_not_sleep() {
        let executor = RetryExecutor::new(RetryPolicy::once());
        let started = Instant::now();
        let calls = AtomicU32::new(0);

        let result: Result<(), &str> = executor
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let executor = RetryExecutor::new(policy(5, 100, 2.0));
        let calls = AtomicU32::new(0);

        let result: Result<u32, &str> = executor
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("flaky")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_hook_does_not_change_control_flow() {
        let executor = RetryExecutor::new(policy(3, 10, 1.0));
        let calls = AtomicU32::new(0);
        let mut seen = Vec::new();

        let result: Result<(), &str> = executor
            .run_with_hook(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("down") }
                },
                |info| {
                    seen.push((info.attempt, info.delay));
                    anyhow::bail!("hook exploded")
                },
            )
            .await;

        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            seen,
            vec![(0, Duration::from_millis(10)), (1, Duration::from_millis(10))]
        );
    }
}
