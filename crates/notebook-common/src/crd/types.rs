//! Shared status types: conditions and their vocabulary

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., BuildComplete, Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert or update a condition by type.
///
/// When a condition of the same type already exists with the same status,
/// its `lastTransitionTime` is kept and only reason and message change.
/// Order of existing entries is preserved; new types are appended.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Condition types set on NotebookValidationJob status
pub mod condition_types {
    /// A build has been triggered
    pub const BUILD_STARTED: &str = "BuildStarted";
    /// The build finished (True) or failed (False)
    pub const BUILD_COMPLETE: &str = "BuildComplete";
    /// The notebook run finished
    pub const VALIDATION_COMPLETE: &str = "ValidationComplete";
    /// The job reached a successful terminal state
    pub const READY: &str = "Ready";
    /// Informational: the controller is making progress or waiting out a transient error
    pub const PROGRESSING: &str = "Progressing";
}

/// Machine-readable condition reasons
pub mod reasons {
    /// Build resources were created
    pub const BUILD_CREATED: &str = "BuildCreated";
    /// The build is still running
    pub const BUILD_IN_PROGRESS: &str = "BuildInProgress";
    /// The build produced an image
    pub const BUILD_SUCCEEDED: &str = "BuildSucceeded";
    /// The build backend reported failure
    pub const BUILD_FAILED: &str = "BuildFailed";
    /// The build ran past its configured timeout
    pub const BUILD_TIMEOUT: &str = "BuildTimeout";
    /// The built image was adopted for validation
    pub const IMAGE_ADOPTED: &str = "ImageAdopted";
    /// The validation pod is running
    pub const VALIDATION_RUNNING: &str = "ValidationRunning";
    /// The notebook executed successfully
    pub const VALIDATION_SUCCEEDED: &str = "ValidationSucceeded";
    /// The notebook failed to execute
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// The runner itself could not be driven
    pub const VALIDATION_ERROR: &str = "ValidationError";
    /// The retry budget was exhausted
    pub const RETRY_LIMIT_EXCEEDED: &str = "RetryLimitExceeded";
    /// The job spec is invalid
    pub const CONFIGURATION_ERROR: &str = "ConfigurationError";
    /// The controller lacks permission for an operation
    pub const RBAC_PERMISSION_DENIED: &str = "RBACPermissionDenied";
    /// A pipeline task could not be found
    pub const TASK_NOT_FOUND: &str = "TaskNotFound";
    /// A referenced credential secret does not exist
    pub const CREDENTIALS_NOT_FOUND: &str = "CredentialsNotFound";
    /// A referenced credential secret is malformed
    pub const INVALID_CREDENTIALS: &str = "InvalidCredentials";
    /// A required resource is gone and will not come back
    pub const RESOURCE_NOT_FOUND: &str = "ResourceNotFound";
    /// A transient API failure is being waited out
    pub const TRANSIENT_ERROR: &str = "TransientError";
    /// A counted, retriable reconcile failure
    pub const RECONCILE_ERROR: &str = "ReconcileError";
}
