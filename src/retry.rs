//! Exponential backoff policies.
//!
//! Two consumers share [`RetryConfig`]: the in-reconcile conflict retry
//! ([`retry_with_backoff_if`], bounded and jittered) and the work queue's
//! per-key failure backoff ([`RetryConfig::delay_for_attempt`]).
//!
//! # Example
//!
//! ```ignore
//! use shoal::retry::{retry_with_backoff_if, RetryConfig};
//!
//! let svc = retry_with_backoff_if(
//!     &RetryConfig::conflict(3),
//!     "update_service",
//!     Error::is_conflict,
//!     || async { services.update(&merged).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff shape for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Short in-pass retry of optimistic-concurrency conflicts: 50ms doubling up to 1s
    pub fn conflict(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }

    /// Backoff used by the work queue after failed reconciles: 1s doubling up to 5m
    pub fn queue_backoff() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }

    /// Un-jittered delay before the given (1-based) attempt, capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// 0.5x to 1.5x of `delay`
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Run `operation`, retrying the errors `should_retry` accepts.
///
/// Any other error is returned immediately, as is the last retryable error
/// once `max_attempts` is reached. Callers only hand in errors whose cause
/// is worth another try within the same reconcile, usually
/// [`crate::Error::is_conflict`].
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            return Err(e);
        }
        if config.exhausted(attempt) {
            warn!(operation = %operation_name, attempt, error = %e, "giving up after max attempts");
            return Err(e);
        }

        let delay = jittered(config.delay_for_attempt(attempt));
        debug!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis(),
            "retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
