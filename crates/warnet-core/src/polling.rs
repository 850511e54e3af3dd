//! Poll loops and exponential backoff.
//!
//! Every long wait in the engine goes through these helpers so that it has a
//! fixed interval, a bounded budget, and a `TimeoutError` naming what it was
//! waiting for.

use crate::error::TimeoutError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Poll `check` every `interval` until it yields a value or `timeout` elapses.
pub async fn poll_for<T, F, Fut>(
    predicate: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<T, TimeoutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = check().await {
            return Ok(value);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(TimeoutError::new(predicate, elapsed));
        }
        sleep(interval.min(timeout - elapsed)).await;
    }
}

/// Poll until `check` returns true or `timeout` elapses.
pub async fn poll_until<F, Fut>(
    predicate: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<(), TimeoutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    poll_for(predicate, interval, timeout, || {
        let fut = check();
        async move { fut.await.then_some(()) }
    })
    .await
}

/// Poll at most `attempts` times, sleeping `interval` between attempts.
pub async fn poll_attempts<T, F, Fut>(
    predicate: &str,
    interval: Duration,
    attempts: u32,
    mut check: F,
) -> Result<T, TimeoutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    for attempt in 1..=attempts.max(1) {
        if let Some(value) = check().await {
            return Ok(value);
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }
    Err(TimeoutError::new(predicate, start.elapsed()))
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Backoff used around Lightning RPC, which can take minutes to come up.
    pub fn lightning_rpc() -> Self {
        Self {
            max_retries: 20,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    /// Delay before retry number `retries` (0-based): `min(base * 2^retries, max)`.
    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds or `max_retries` retries are spent.
///
/// The error of the final attempt is returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut>(
    backoff: &Backoff,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut retries = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retries < backoff.max_retries => {
                let delay = backoff.delay(retries);
                debug!(operation, retries, ?delay, error = %e, "retrying after failure");
                sleep(delay).await;
                retries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_delay_is_capped() {
        let backoff = Backoff {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(4), Duration::from_secs(10));
        assert_eq!(backoff.delay(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out_after_budget() {
        let start = Instant::now();
        let result = poll_until(
            "never",
            Duration::from_millis(100),
            Duration::from_secs(2),
            || async { false },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.predicate, "never");
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(err.waited >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_for_returns_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let value = poll_for("third call", Duration::from_millis(10), Duration::from_secs(1), || {
            let c = Arc::clone(&c);
            async move { (c.fetch_add(1, Ordering::SeqCst) == 2).then_some(42) }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_attempts_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), _> =
            poll_attempts("bounded", Duration::from_millis(10), 4, || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    None
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error_unchanged() {
        let backoff = Backoff {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), String> = retry_with_backoff(&backoff, "flaky", || {
            let c = Arc::clone(&c);
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                Err(format!("attempt {n}"))
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), "attempt 3");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<u32, String> = retry_with_backoff(&Backoff::default(), "flaky", || {
            let c = Arc::clone(&c);
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("cold".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
