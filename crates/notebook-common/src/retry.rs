//! Retry policies.
//!
//! Two distinct mechanisms live here:
//!
//! - [`RetryPolicy`] decides how a *job* is requeued after a classified
//!   failure: a fixed short delay for transient errors and a fixed,
//!   bounded schedule for retriable ones. The delay is returned to the
//!   controller as a requeue; nothing sleeps.
//! - [`retry_with_backoff`] retries a single in-process operation with
//!   exponential backoff and jitter. It is used outside reconciliation
//!   (e.g. installing the CRD at startup) where blocking is acceptable.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::{classify, Error};

/// Default number of counted retries before a job fails
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay after a transient failure
pub const DEFAULT_TRANSIENT_DELAY: Duration = Duration::from_secs(60);

/// Default retriable backoff schedule, indexed by retry count
pub const DEFAULT_BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(300),
];

/// Job-level retry policy applied after a failure has been classified
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// A job fails once its retry count exceeds this
    pub max_retries: u32,
    /// Requeue delays for retriable failures; the last entry repeats
    pub backoff_schedule: Vec<Duration>,
    /// Requeue delay for transient failures
    pub transient_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_schedule: DEFAULT_BACKOFF_SCHEDULE.to_vec(),
            transient_delay: DEFAULT_TRANSIENT_DELAY,
        }
    }
}

/// What to do after counting a retriable failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after the given delay
    Requeue(Duration),
    /// The retry budget is spent; fail the job
    Exhausted,
}

impl RetryPolicy {
    /// Backoff for a job whose retry count has just become `retry_count`.
    ///
    /// Counts start at 1; a count of 0 is treated as 1. Counts beyond the
    /// end of the schedule reuse its last entry.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let idx = retry_count.saturating_sub(1) as usize;
        self.backoff_schedule
            .get(idx)
            .or_else(|| self.backoff_schedule.last())
            .copied()
            .unwrap_or(self.transient_delay)
    }

    /// Decide the outcome for a job whose retry count has just been
    /// incremented to `retry_count`.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count > self.max_retries {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Requeue(self.backoff_for(retry_count))
        }
    }
}

/// Configuration for in-process operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Run an API operation, retrying failures the classifier does not deem
/// terminal.
///
/// Delays grow by `backoff_multiplier` up to `max_delay`, each scaled by a
/// random factor in `[0.5, 1.5)`. A terminal error, or the last error once
/// `max_attempts` is reached, is returned as is.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        let class = classify(&err).class;
        let exhausted = config.max_attempts > 0 && attempt >= config.max_attempts;
        if !err.is_retryable() || exhausted {
            error!(
                operation = %operation_name,
                attempt,
                %class,
                error = %err,
                "operation failed, giving up"
            );
            return Err(err);
        }

        let jittered = delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        warn!(
            operation = %operation_name,
            attempt,
            %class,
            error = %err,
            delay_ms = jittered.as_millis(),
            "operation failed, retrying"
        );
        tokio::time::sleep(jittered).await;

        delay = delay.mul_f64(config.backoff_multiplier).min(config.max_delay);
    }
}
