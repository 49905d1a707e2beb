// ============================================================================
// Exponential Backoff With Jitter
// ============================================================================

use super::RetryBudget;
use crate::core::failure_chain;
use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::info;

/// Delay before the first retry, before jitter.
pub const BASE_DELAY_MS: f64 = 10.0;

/// Ceiling for any single delay.
pub const MAX_DELAY_MS: f64 = 1_000.0;

// 10ms * 2^8 jittered down to half still exceeds the ceiling
const MAX_EXPONENT: u32 = 8;

/// Randomises `delay_ms` into `[delay/2, 1.5 * delay]`.
pub fn jitter(delay_ms: f64) -> f64 {
    delay_ms / 2.0 + rand::random::<f64>() * delay_ms
}

/// Jittered delay, in milliseconds, to wait after the `attempt`-th failure.
pub fn backoff_delay_ms(attempt: u32) -> f64 {
    let exponent = attempt.min(MAX_EXPONENT) as i32;
    jitter(BASE_DELAY_MS * 2f64.powi(exponent)).min(MAX_DELAY_MS)
}

/// Runs `operation` until it succeeds or `budget` is spent.
///
/// Every exit path hands back the operation's own error value: a failure
/// outside the allow-list aborts after that single invocation, a projected
/// overrun of `max_time` aborts without sleeping, and the last failure is
/// returned once `max_attempts` invocations have failed.
///
/// The attempt limit is checked before any delay is computed, so the final
/// failure is returned at once, without a final wait.
///
/// # Examples
///
/// ```
/// # use robust_tx::backoff::{retry, RetryBudget};
/// # use robust_tx::TxError;
/// # #[tokio::main]
/// # async fn main() {
/// let mut calls = 0;
/// let result = retry(
///     || {
///         calls += 1;
///         let failing = calls < 3;
///         async move {
///             if failing {
///                 Err(TxError::Driver("database is locked".into()))
///             } else {
///                 Ok(42)
///             }
///         }
///     },
///     &RetryBudget::new().max_time_ms(1_000),
/// )
/// .await;
/// assert_eq!(result.unwrap(), 42);
/// assert_eq!(calls, 3);
/// # }
/// ```
pub async fn retry<T, E, F, Fut>(mut operation: F, budget: &RetryBudget) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: StdError + 'static,
{
    let started = Instant::now();
    let max_time_ms = budget.max_time.as_secs_f64() * 1_000.0;
    let mut attempt: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let chain = failure_chain(&err);
        if budget.verbose {
            info!(attempt, failure = %chain, "Error detected");
        }

        if !budget.permits(&chain) {
            return Err(err);
        }

        attempt += 1;
        if attempt >= budget.max_attempts.get() {
            if budget.verbose {
                info!(attempts = attempt, "Exceeded maximum attempts for backoff");
            }
            return Err(err);
        }

        let delay_ms = backoff_delay_ms(attempt);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        if elapsed_ms + delay_ms > max_time_ms {
            if budget.verbose {
                info!(elapsed_ms, delay_ms, "Exceeded maximum allowed time for backoff");
            }
            return Err(err);
        }

        if budget.verbose {
            info!(attempt, delay_ms, "Waiting before retrying");
        }
        sleep(Duration::from_secs_f64(delay_ms / 1_000.0)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TxError;
    use regex::Regex;

    fn locked() -> TxError {
        TxError::query("BEGIN", "database is locked")
    }

    #[tokio::test]
    async fn test_success_needs_one_call() {
        let mut calls = 0;
        let result: Result<u32, TxError> = retry(
            || {
                calls += 1;
                async { Ok(1) }
            },
            &RetryBudget::new(),
        )
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_once() {
        let mut calls = 0;
        let result = retry(
            || {
                calls += 1;
                let n = calls;
                async move {
                    if n == 1 {
                        Err(TxError::ExecutionError("Failed".into()))
                    } else {
                        Ok(1)
                    }
                }
            },
            &RetryBudget::new(),
        )
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_returns_last_failure() {
        let mut calls = 0;
        let result: Result<(), TxError> = retry(
            || {
                calls += 1;
                let n = calls;
                async move { Err(TxError::ExecutionError(format!("failure {}", n))) }
            },
            &RetryBudget::new().max_attempts(5).max_time_ms(60_000),
        )
        .await;

        assert_eq!(calls, 5);
        assert_eq!(result.unwrap_err().to_string(), "Execution error: failure 5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_exit_does_not_sleep() {
        let start = Instant::now();
        let result: Result<(), TxError> = retry(
            || async { Err(locked()) },
            &RetryBudget::new().max_attempts(1).max_time_ms(60_000),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget_stops_before_deadline() {
        let start = Instant::now();
        let mut calls: u32 = 0;
        let result: Result<(), TxError> = retry(
            || {
                calls += 1;
                async { Err(TxError::ExecutionError("Failed".into())) }
            },
            &RetryBudget::new().max_time_ms(100),
        )
        .await;

        let elapsed = start.elapsed();
        assert!(result.is_err());
        assert!(elapsed <= Duration::from_millis(100), "elapsed {:?}", elapsed);

        // Each completed sleep lasted at least half of its un-jittered delay
        let min_slept: f64 = (1..calls).map(|a| BASE_DELAY_MS * 2f64.powi(a as i32) / 2.0).sum();
        assert!(elapsed.as_secs_f64() * 1_000.0 >= min_slept);
        assert!(calls > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_list_match_is_retried() {
        let mut calls = 0;
        let budget = RetryBudget::new().allow_failures([Regex::new("database is locked").unwrap()]);
        let result = retry(
            || {
                calls += 1;
                let n = calls;
                async move { if n < 3 { Err(locked()) } else { Ok("done") } }
            },
            &budget,
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_list_mismatch_fails_instantly() {
        let start = Instant::now();
        let mut calls = 0;
        let budget = RetryBudget::new().allow_failures([Regex::new("database is locked").unwrap()]);
        let result: Result<(), TxError> = retry(
            || {
                calls += 1;
                async { Err(TxError::Driver("UNIQUE constraint failed: users.id".into())) }
            },
            &budget,
        )
        .await;

        assert_eq!(calls, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(result.unwrap_err().to_string(), "UNIQUE constraint failed: users.id");
    }

    #[tokio::test(start_paused = true)]
    async fn test_verbose_does_not_change_outcome() {
        let mut calls = 0;
        let result: Result<(), TxError> = retry(
            || {
                calls += 1;
                async { Err(locked()) }
            },
            &RetryBudget::new().max_attempts(3).verbose(true),
        )
        .await;

        assert_eq!(calls, 3);
        assert!(matches!(result, Err(TxError::Query { .. })));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..10_000 {
            let d = jitter(100.0);
            assert!((50.0..=150.0).contains(&d), "jitter out of range: {}", d);
        }
    }

    #[test]
    fn test_delay_is_capped() {
        for attempt in [MAX_EXPONENT, 20, 10_000] {
            assert_eq!(backoff_delay_ms(attempt), MAX_DELAY_MS);
        }
        let first = backoff_delay_ms(1);
        assert!((10.0..=30.0).contains(&first));
    }
}
