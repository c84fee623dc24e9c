//! Bounded reconnect backoff.
//!
//! Used when a process loses the arbiter race and has to find the freshly
//! elected hub, which may not be listening yet. Delays grow exponentially,
//! are capped, and get multiplicative jitter so a crowd of losers does not
//! hammer the new hub in lockstep. Jitter can be switched off for tests.

use crate::cancel::CancellationToken;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-indexed): `base * 2^attempt`,
    /// capped at `max_delay`, then scaled by a factor in `[0.5, 1.5)` when
    /// jitter is on.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2f64.powi(attempt.min(30) as i32);
        let capped_secs =
            (self.base_delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// What a retry loop did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total delay slept between attempts.
    pub total_delay: Duration,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

/// Why [`retry_async`] stopped without a value.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The operation failed with a non-retryable error or ran out of attempts.
    Failed(E),
    /// The token fired while waiting between attempts.
    Cancelled,
}

/// Retry an async operation with exponential backoff until it succeeds,
/// fails with an error `should_retry` rejects, runs out of attempts, or
/// `cancel` fires during a backoff sleep.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, RetryFailure<E>>, RetryStats)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;

        let err = match operation(attempt).await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };
        stats.last_error = Some(err.to_string());

        if !should_retry(&err) {
            debug!("Error is not retryable: {}", err);
            return (Err(RetryFailure::Failed(err)), stats);
        }

        if attempt + 1 >= max_attempts {
            warn!(
                "All {} attempts exhausted. Last error: {}",
                max_attempts, err
            );
            return (Err(RetryFailure::Failed(err)), stats);
        }

        let delay = config.calculate_delay(attempt);
        stats.total_delay += delay;
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt + 1,
            max_attempts,
            err,
            delay
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Retry loop cancelled during backoff");
                return (Err(RetryFailure::Cancelled), stats);
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}
