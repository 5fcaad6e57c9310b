//! Policy-driven retry with exponential backoff and jitter.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::error::Error;

/// The backoff policy of a retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// total number of attempts, including the first one
    pub max_attempts: u32,
    /// delay before the second attempt
    pub initial_delay: Duration,
    /// ceiling on any single delay
    pub max_delay: Duration,
    /// backoff growth factor, at least 1
    pub multiplier: f64,
    /// jitter fraction in `[0, 1]`,
    /// spreading each delay by `±jitter`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy which never retries.
    pub fn no_retries() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    /// The base delay after the given attempt (starting at 1),
    /// before jitter:
    /// `min(max_delay, initial_delay * multiplier^(attempt-1))`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base.as_secs_f64() * (1.0 + spread)).max(0.0))
    }
}

/// The state of a retry loop, passed to every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// the attempt number, starting at 1
    pub attempt: u32,
    /// time elapsed since the first attempt started
    pub elapsed: Duration,
}

/// The final result of a retried operation,
/// together with the number of attempts consumed.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, Error>,
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// The number of retries performed after the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Executes operations under a [`RetryPolicy`],
/// retrying only errors whose
/// [`retryable`](crate::error::Error::retryable) flag is set.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        RetryExecutor { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the operation until it succeeds,
    /// fails with a non-retryable error,
    /// or exhausts the attempt budget.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            let context = RetryContext {
                attempt,
                elapsed: started.elapsed(),
            };
            match operation(context).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(error) if error.retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.jittered_delay(attempt);
                    debug!(
                        attempt,
                        ?delay,
                        error = %error,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeoutKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        // capped by max_delay
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
    }

    #[test]
    fn multiplier_below_one_is_clamped() {
        let policy = RetryPolicy {
            multiplier: 0.5,
            initial_delay: Duration::from_secs(2),
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        });
        let calls = AtomicU32::new(0);

        let outcome = executor
            .run(|context| {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(context.attempt, call);
                async move {
                    if call < 3 {
                        Err(Error::ConnectionClosed)
                    } else {
                        Ok(call)
                    }
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries(), 2);
        assert_eq!(outcome.result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_permanent_failures() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<()> = executor
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::StoreFailed { status: 0xA700 }) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(
            outcome.result,
            Err(Error::StoreFailed { status: 0xA700 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_the_attempt_budget() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        });
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<()> = executor
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::Timeout {
                        kind: TimeoutKind::Read,
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, Err(Error::Timeout { .. })));
    }
}
