//! Reconcile timing

use std::time::Duration;

use notebook_common::retry::RetryPolicy;

/// Default delay between build status polls
pub const DEFAULT_BUILD_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default delay after triggering a build
pub const DEFAULT_BUILD_CREATE_INTERVAL: Duration = Duration::from_secs(10);

/// Default delay between validation pod polls
pub const DEFAULT_VALIDATION_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Timing and retry settings for the driver
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileConfig {
    /// Retry budget and backoff for classified failures
    pub retry: RetryPolicy,
    /// Requeue delay while a build is pending or running
    pub build_poll_interval: Duration,
    /// Requeue delay right after a build was triggered
    pub build_create_interval: Duration,
    /// Requeue delay while the notebook is executing
    pub validation_poll_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            build_poll_interval: DEFAULT_BUILD_POLL_INTERVAL,
            build_create_interval: DEFAULT_BUILD_CREATE_INTERVAL,
            validation_poll_interval: DEFAULT_VALIDATION_POLL_INTERVAL,
        }
    }
}
