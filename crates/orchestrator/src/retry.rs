//! Bounded retries with randomized exponential backoff.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use syncd_core::RetryConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

// Keeps 2^(n+1) well inside f64 and Duration range.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{description}: canceled while waiting to retry")]
    Canceled { description: String },

    #[error("{description}: failed after {attempts} attempt(s): {source}")]
    Exhausted {
        description: String,
        attempts: u32,
        #[source]
        source: E,
    },
}

pub struct Retry {
    max_retries: u32,
    base_delay: Duration,
    rng: Mutex<StdRng>,
}

impl Retry {
    /// `seed` defaults to the current time in nanoseconds.
    pub fn new(config: RetryConfig, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default()
        });
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Wait before retry `attempt` (1-based): uniform in
    /// `[2^attempt, 2^(attempt+1))` times the base delay.
    pub fn wait_time(&self, attempt: u32) -> Duration {
        let exp = attempt.min(MAX_BACKOFF_EXPONENT) as i32;
        let low = 2f64.powi(exp);
        let high = 2f64.powi(exp + 1);
        let factor = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(low..high);
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    /// Runs `op`, retrying failures up to `max_retries` times. A cancel
    /// during a backoff wait returns [`RetryError::Canceled`] immediately.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        description: &str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(description, retries = attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if attempt >= self.max_retries {
                error!(
                    description,
                    attempts = attempt + 1,
                    error = %err,
                    "All retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    description: description.to_string(),
                    attempts: attempt + 1,
                    source: err,
                });
            }

            attempt += 1;
            let wait = self.wait_time(attempt);
            warn!(
                description,
                attempt,
                max_retries = self.max_retries,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Operation failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Canceled {
                        description: description.to_string(),
                    });
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retry(max_retries: u32, base_delay: Duration) -> Retry {
        Retry::new(
            RetryConfig {
                max_retries,
                base_delay,
            },
            Some(42),
        )
    }

    #[test]
    fn test_wait_time_bounds() {
        let retry = retry(2, Duration::from_secs(1));
        for attempt in 1..=4u32 {
            let wait = retry.wait_time(attempt);
            assert!(wait >= Duration::from_secs(1 << attempt));
            assert!(wait < Duration::from_secs(1 << (attempt + 1)));
        }
    }

    #[test]
    fn test_wait_time_saturates_for_huge_base_delay() {
        let retry = retry(2, Duration::MAX);
        assert_eq!(retry.wait_time(3), Duration::MAX);
        assert_eq!(retry.wait_time(u32::MAX), Duration::MAX);
    }

    #[test]
    fn test_same_seed_same_waits() {
        let a = retry(2, Duration::from_secs(1));
        let b = retry(2, Duration::from_secs(1));
        assert_eq!(a.wait_time(1), b.wait_time(1));
        assert_eq!(a.wait_time(2), b.wait_time(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let retry = retry(2, Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result = retry
            .run(&CancellationToken::new(), "apply", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DriverError::backend("flaky"))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reports_attempts() {
        let retry = retry(2, Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry
            .run(&CancellationToken::new(), "apply web", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DriverError::backend("boom"))
            })
            .await;

        match result {
            Err(RetryError::Exhausted {
                description,
                attempts,
                source,
            }) => {
                assert_eq!(description, "apply web");
                assert_eq!(attempts, 3);
                assert_eq!(source, DriverError::backend("boom"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let retry = retry(0, Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry
            .run(&CancellationToken::new(), "apply", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DriverError::backend("boom"))
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_returns_immediately() {
        let retry = retry(5, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<(), _> = retry
            .run(&cancel, "apply", || async { Err(DriverError::backend("boom")) })
            .await;

        assert!(matches!(result, Err(RetryError::Canceled { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
