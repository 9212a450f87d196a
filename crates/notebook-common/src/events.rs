//! Kubernetes Event recording for the validation controller.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// * `reason` - Machine-readable reason (e.g. "BuildStarted")
    /// * `action` - What the controller did (e.g. "Build")
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown under REASON in `kubectl get events`.
pub mod reasons {
    /// Build resources created
    pub const BUILD_STARTED: &str = "BuildStarted";
    /// Build produced an image
    pub const BUILD_SUCCEEDED: &str = "BuildSucceeded";
    /// Build failed or was cancelled
    pub const BUILD_FAILED: &str = "BuildFailed";
    /// Validation pod started
    pub const VALIDATION_STARTED: &str = "ValidationStarted";
    /// Notebook executed successfully
    pub const VALIDATION_SUCCEEDED: &str = "ValidationSucceeded";
    /// Notebook failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Retry budget exhausted
    pub const RETRY_LIMIT_EXCEEDED: &str = "RetryLimitExceeded";
    /// Waiting out a transient API failure
    pub const TRANSIENT_ERROR: &str = "TransientError";
    /// Job failed for a non-retriable reason
    pub const JOB_FAILED: &str = "JobFailed";
}

/// Event actions, shown under ACTION in `kubectl get events`.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Triggering or polling a build
    pub const BUILD: &str = "Build";
    /// Running the notebook
    pub const VALIDATE: &str = "Validate";
}
