use crate::sender::Outcome;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("Terminal failure on attempt {attempts}: {reason}")]
    Terminal {
        status: Option<u16>,
        reason: String,
        attempts: u32,
    },
    #[error("Maximum retry attempts exceeded ({attempts}): {last_reason}")]
    MaxAttemptsExceeded { attempts: u32, last_reason: String },
    /// Stopped while waiting to retry.
    #[error("Cancelled during backoff after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Terminal { attempts, .. }
            | RetryError::MaxAttemptsExceeded { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

/// Successful delivery after one or more attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub status: u16,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Scale each wait by a random factor in [0.5, 1.5).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            jitter: false,
        }
    }
}

/// Bounded attempts with exponential backoff. Every upload path goes through here.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn from_parts(max_attempts: u32, initial_delay: Duration) -> Self {
        Self::new(RetryConfig {
            max_attempts,
            initial_delay,
            jitter: false,
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Wait before retry `retry` (1-based): `initial_delay * 2^(retry - 1)`, without jitter.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1_u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.config.initial_delay.saturating_mul(factor)
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// The closure receives the 1-based attempt number. An attempt in flight
    /// always completes; `cancel` is observed during the backoff between attempts.
    pub async fn execute<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<Delivery, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let max_attempts = self.max_attempts();
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            match operation(attempt).await {
                Outcome::Success { status } => {
                    if attempt > 1 {
                        info!(attempt, status, "delivered after retry");
                    }
                    return Ok(Delivery {
                        status,
                        attempts: attempt,
                    });
                }
                Outcome::TerminalFailure { status, reason } => {
                    warn!(attempt, ?status, %reason, "terminal failure, not retrying");
                    return Err(RetryError::Terminal {
                        status,
                        reason,
                        attempts: attempt,
                    });
                }
                Outcome::RetryableFailure { reason, .. } => {
                    last_reason = reason;
                    if attempt < max_attempts {
                        let delay = self.apply_jitter(self.delay_for_retry(attempt));
                        debug!(attempt, ?delay, reason = %last_reason, "retryable failure, backing off");
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => {
                                info!(attempt, "retry cancelled during backoff");
                                return Err(RetryError::Cancelled { attempts: attempt });
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        warn!(attempts = max_attempts, reason = %last_reason, "giving up after max attempts");
        Err(RetryError::MaxAttemptsExceeded {
            attempts: max_attempts,
            last_reason,
        })
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.config.jitter {
            return delay;
        }
        let mut rng = rand::rng();
        let jitter_factor = rng.random_range(0.5..1.5);
        let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
        Duration::from_millis(jittered_millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retryable() -> Outcome {
        Outcome::RetryableFailure {
            status: Some(503),
            reason: "HTTP 503".into(),
        }
    }

    #[test]
    fn test_delay_doubles_per_retry() {
        let policy = RetryPolicy::from_parts(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::from_parts(100, Duration::from_secs(1));
        assert!(policy.delay_for_retry(90) >= policy.delay_for_retry(31));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            jitter: true,
        });
        for _ in 0..20 {
            let delay = policy.apply_jitter(Duration::from_millis(200));
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt_does_not_sleep() {
        let policy = RetryPolicy::from_parts(3, Duration::from_secs(10));
        let start = tokio::time::Instant::now();
        let delivery = policy
            .execute(&CancellationToken::new(), |_| async {
                Outcome::Success { status: 200 }
            })
            .await
            .unwrap();
        assert_eq!(delivery.attempts, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::from_parts(5, Duration::from_millis(10));

        let counter = calls.clone();
        let result = policy
            .execute(&CancellationToken::new(), move |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 2 {
                        Outcome::TerminalFailure {
                            status: Some(400),
                            reason: "HTTP 400".into(),
                        }
                    } else {
                        retryable()
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result,
            Err(RetryError::Terminal {
                status: Some(400),
                attempts: 2,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempt_count() {
        let policy = RetryPolicy::from_parts(3, Duration::from_millis(50));
        let start = tokio::time::Instant::now();
        let result = policy
            .execute(&CancellationToken::new(), |_| async { retryable() })
            .await;

        assert_eq!(
            result,
            Err(RetryError::MaxAttemptsExceeded {
                attempts: 3,
                last_reason: "HTTP 503".into()
            })
        );
        // 50ms + 100ms, no wait after the last attempt
        assert_eq!(start.elapsed(), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_attempts_still_tries_once() {
        let policy = RetryPolicy::from_parts(0, Duration::from_millis(50));
        let delivery = policy
            .execute(&CancellationToken::new(), |_| async {
                Outcome::Success { status: 201 }
            })
            .await
            .unwrap();
        assert_eq!(delivery.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_returns_within_one_step() {
        let policy = RetryPolicy::from_parts(3, Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = policy.execute(&cancel, |_| async { retryable() }).await;

        assert_eq!(result, Err(RetryError::Cancelled { attempts: 1 }));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
