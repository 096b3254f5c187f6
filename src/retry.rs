//! Bounded retry with exponential backoff for transient external-call failures.
//!
//! Only errors that report themselves as transient are retried. Everything
//! else, and the last transient error once attempts run out, is returned to
//! the caller, which logs it and moves on to the next cycle.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Classifies an error as worth retrying or not.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Ceiling for any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied after each failed attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryConfig {
    /// A schedule that never sleeps; handy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_factor: 1.0,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt, before jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * exp) as u64;
        Duration::from_millis(millis.min(self.max_delay_ms))
    }
}

/// Run `op`, retrying while it fails with a transient error and attempts remain.
pub async fn retry_transient<T, E, F, Fut>(name: &str, config: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let base = config.delay_after(attempt);
                let jitter = if base.is_zero() {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4))
                };
                tracing::warn!(
                    operation = name,
                    attempt,
                    max_attempts,
                    delay_ms = (base + jitter).as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(base + jitter).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct FakeError {
        transient: bool,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake (transient={})", self.transient)
        }
    }

    impl Transient for FakeError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[test]
    fn delay_grows_geometrically_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_after(1), Duration::from_secs(2));
        assert_eq!(config.delay_after(2), Duration::from_secs(4));
        assert_eq!(config.delay_after(3), Duration::from_secs(8));
        assert_eq!(config.delay_after(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn transient_error_is_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, FakeError> = retry_transient("op", &RetryConfig::immediate(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(FakeError { transient: true }) } else { Ok(n) }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FakeError> = retry_transient("op", &RetryConfig::immediate(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FakeError { transient: false })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FakeError> = retry_transient("op", &RetryConfig::immediate(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FakeError { transient: true })
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleeps_between_attempts() {
        let start = tokio::time::Instant::now();
        let config = RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1_000,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
        };
        let _: Result<(), FakeError> =
            retry_transient("op", &config, || async { Err(FakeError { transient: true }) }).await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
