//! Retry with a gradually increasing backoff.
//!
//! The waiter is a closed-form generalized Fibonacci sequence, which grows
//! faster than a linear backoff but far slower than an exponential one.

use std::future::Future;
use std::time::Duration;

/// The `n`th term of the generalized Fibonacci sequence starting at `f0, f1`.
///
/// Negative or NaN starting values are treated as zero; the result is never
/// negative.
pub fn generalized_fibonacci(n: u32, f0: f64, f1: f64) -> f64 {
    let f0 = f0.max(0.0);
    let f1 = f1.max(0.0);

    let sqrt5 = 5f64.sqrt();
    let phi = (1.0 + sqrt5) / 2.0;
    let psi = 1.0 - phi;
    let a = (f1 - f0 * psi) / sqrt5;
    let b = (f0 * phi - f1) / sqrt5;

    let exponent = n as i32;
    (a * phi.powi(exponent) + b * psi.powi(exponent)).max(0.0)
}

/// Seconds to wait before retry number `attempt` (1-based), rounded to 0.1s.
pub fn fibonacci_wait(attempt: u32) -> f64 {
    (generalized_fibonacci(attempt, 1.0, 1.0) * 10.0).round() / 10.0
}

/// Retry policy for [`retry_with_backoff`]
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Seconds to wait given the 1-based retry number
    pub waiter: fn(u32) -> f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            waiter: fibonacci_wait,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64((self.waiter)(attempt).max(0.0))
    }
}

/// Call `operation`, retrying at most `policy.max_retries` times while
/// `is_retryable` accepts the error. The last error is returned once retries
/// are exhausted; non-retryable errors are returned immediately.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: RetryPolicy,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if retries < policy.max_retries && is_retryable(&e) => {
                retries += 1;
                let delay = policy.delay(retries);
                log::warn!(
                    "{e} (retry {retries}/{} in {:.1}s)",
                    policy.max_retries,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_wait(_: u32) -> f64 {
        0.0
    }

    #[test]
    fn test_standard_fibonacci_sequence() {
        let terms: Vec<f64> = (0..10)
            .map(|n| generalized_fibonacci(n, 1.0, 1.0).round())
            .collect();
        assert_eq!(
            terms,
            vec![1.0, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0, 55.0]
        );
    }

    #[test]
    fn test_generalized_starting_values() {
        // 0, 1, 1, 2, 3, 5 ...
        assert!((generalized_fibonacci(0, 0.0, 1.0) - 0.0).abs() < 1e-9);
        assert!((generalized_fibonacci(5, 0.0, 1.0) - 5.0).abs() < 1e-9);
        // 2, 0.5, 2.5, 3, 5.5
        assert!((generalized_fibonacci(4, 2.0, 0.5) - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_negative_starts_are_clamped() {
        assert_eq!(generalized_fibonacci(3, -4.0, -1.0), 0.0);
    }

    #[test]
    fn test_wait_grows_and_rounds() {
        let waits: Vec<f64> = (1..=5).map(fibonacci_wait).collect();
        assert_eq!(waits, vec![1.0, 2.0, 3.0, 5.0, 8.0]);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 4,
            waiter: no_wait,
        };

        let result: Result<u32, String> = retry_with_backoff(
            policy,
            |_| true,
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("attempt {n} failed")) } else { Ok(n) }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            waiter: no_wait,
        };

        let result: Result<(), String> = retry_with_backoff(
            policy,
            |_| true,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("connection reset".to_string())
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), "connection reset");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = retry_with_backoff(
            RetryPolicy::new(4),
            |e: &String| e.starts_with("transient"),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("HTTP 404".to_string())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
