//! Bounded-attempt retry shared by the planner (provider calls) and the
//! executor (step attempts).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

const MAX_BACKOFF_SHIFT: u32 = 6;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
            jitter: true,
        }
    }
}

/// Outcome of a retried operation plus how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> Attempted<T, E> {
    pub fn retries_used(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            strategy: BackoffStrategy::Fixed,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            jitter: false,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0 = the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(1_u64 << retry.min(MAX_BACKOFF_SHIFT)),
        };
        let capped = if self.max_delay_ms > 0 {
            base.min(self.max_delay_ms)
        } else {
            base
        };
        if !self.jitter || capped <= 1 {
            return Duration::from_millis(capped);
        }
        // Jitter keeps the delay in [50%, 100%] of the deterministic value.
        let low = capped / 2;
        let spread = (capped - low) as f64 * rand::random::<f64>();
        Duration::from_millis(low + spread as u64)
    }

    pub async fn run<T, E, F, Fut>(&self, deadline: Option<Instant>, op: F) -> Attempted<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_observed(deadline, op, |_, _, _| {}).await
    }

    /// Runs `op` until it succeeds, returns a non-retryable error, exhausts
    /// `max_retries`, or the next backoff would cross `deadline`.
    /// `on_retry` sees the failed attempt number, its error and the delay.
    pub async fn run_observed<T, E, F, Fut, H>(
        &self,
        deadline: Option<Instant>,
        mut op: F,
        mut on_retry: H,
    ) -> Attempted<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: FnMut(u32, &E, Duration),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= self.max_attempts() {
                return Attempted {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = self.delay_for(attempt - 1);
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    debug!(attempt, "retry budget cut short by deadline");
                    return Attempted {
                        result: Err(error),
                        attempts: attempt,
                    };
                }
            }

            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
            on_retry(attempt, &error, delay);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Debug)]
    struct Flaky {
        retryable: bool,
    }

    impl Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(retryable={})", self.retryable)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(2), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_millis(2_000));
    }

    #[test]
    fn jittered_backoff_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..64 {
            let delay = policy.delay_for(2).as_millis() as u64;
            assert!((400..=800).contains(&delay), "delay {delay} out of range");
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = Cell::new(0);
        let outcome: Attempted<(), Flaky> = RetryPolicy::fixed(3, 1)
            .run(None, |_| {
                calls.set(calls.get() + 1);
                async { Err(Flaky { retryable: true }) }
            })
            .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.retries_used(), 3);
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let outcome: Attempted<(), Flaky> = RetryPolicy::fixed(5, 1)
            .run(None, |_| async { Err(Flaky { retryable: false }) })
            .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn succeeds_on_later_attempt() {
        let outcome: Attempted<u32, Flaky> = RetryPolicy::fixed(3, 1)
            .run(None, |attempt| async move {
                if attempt < 3 {
                    Err(Flaky { retryable: true })
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(outcome.result.as_ref().ok().copied(), Some(3));
        assert_eq!(outcome.retries_used(), 2);
    }

    #[tokio::test]
    async fn deadline_bounds_retries_even_when_attempts_are_fast() {
        let deadline = Instant::now() + Duration::from_millis(30);
        let outcome: Attempted<(), Flaky> = RetryPolicy::fixed(1_000, 20)
            .run(Some(deadline), |_| async { Err(Flaky { retryable: true }) })
            .await;
        assert!(outcome.attempts < 1_000);
        assert!(Instant::now() <= deadline + Duration::from_millis(25));
    }

    #[tokio::test]
    async fn observer_sees_each_retry() {
        let mut seen = Vec::new();
        let _: Attempted<(), Flaky> = RetryPolicy::fixed(2, 1)
            .run_observed(
                None,
                |_| async { Err(Flaky { retryable: true }) },
                |attempt, _, _| seen.push(attempt),
            )
            .await;
        assert_eq!(seen, vec![1, 2]);
    }
}
