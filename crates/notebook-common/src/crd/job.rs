//! NotebookValidationJob CRD types
//!
//! A `NotebookValidationJob` names a notebook in a git repository and the
//! container it should run in. When a build descriptor is present and
//! enabled, the notebook's repository is first built into an image by one of
//! the build strategies, and validation runs against that image.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, Condition};
use crate::duration::parse_duration;
use crate::Error;

/// Default base image used when a build does not name one
pub const DEFAULT_BASE_IMAGE: &str = "quay.io/jupyter/minimal-notebook:latest";

/// Default build strategy name
pub const DEFAULT_BUILD_STRATEGY: &str = "s2i";

/// Default overall validation timeout
pub const DEFAULT_JOB_TIMEOUT: &str = "30m";

/// Default build timeout
pub const DEFAULT_BUILD_TIMEOUT: &str = "15m";

// =============================================================================
// Phases
// =============================================================================

/// Lifecycle phase of a NotebookValidationJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ValidationPhase {
    /// Job has not been processed yet (an empty phase also reads as this)
    #[default]
    #[serde(alias = "")]
    Initializing,
    /// An image build is in flight
    Building,
    /// The build finished and its image was adopted
    BuildComplete,
    /// The notebook is executing
    ValidationRunning,
    /// The notebook executed successfully
    Succeeded,
    /// The job failed
    Failed,
}

impl ValidationPhase {
    /// True once the job can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Building => write!(f, "Building"),
            Self::BuildComplete => write!(f, "BuildComplete"),
            Self::ValidationRunning => write!(f, "ValidationRunning"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Phase of the image build as recorded on the job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BuildPhase {
    /// Build was triggered but has not started
    #[default]
    Pending,
    /// Build is running
    Running,
    /// Build produced an image
    Complete,
    /// Build failed or was cancelled
    Failed,
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Spec
// =============================================================================

/// Git location of the notebook
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    /// Repository URL (https)
    pub url: String,

    /// Branch, tag or commit
    #[serde(rename = "ref", default = "default_git_ref")]
    pub ref_: String,

    /// Secret with `username` and `password` (or `token`) keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,
}

/// Notebook to validate
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotebookSource {
    /// Repository holding the notebook
    pub git: GitSource,

    /// Path of the notebook within the repository
    pub path: String,
}

/// Plain name/value environment variable for the validation container
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EnvVarSpec {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

/// Resource requests and limits for the validation container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ContainerResources {
    /// Resource requests (e.g., cpu: "500m")
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    /// Resource limits (e.g., memory: "2Gi")
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Build descriptor: how to turn the notebook's repository into an image
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfigSpec {
    /// Whether the build phase runs at all
    #[serde(default)]
    pub enabled: bool,

    /// Build strategy name ("s2i" or "tekton")
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Base image for the build
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Path to a Dockerfile in the repository; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    /// Maximum time a build may run (e.g., "15m")
    #[serde(default = "default_build_timeout")]
    pub timeout: String,

    /// Backend-specific parameters (e.g., registry)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub strategy_config: BTreeMap<String, String>,
}

impl Default for BuildConfigSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: default_strategy(),
            base_image: default_base_image(),
            dockerfile: None,
            timeout: default_build_timeout(),
            strategy_config: BTreeMap::new(),
        }
    }
}

impl BuildConfigSpec {
    /// Parsed build timeout; zero is rejected
    pub fn timeout_duration(&self) -> Result<Duration, Error> {
        positive_duration(&self.timeout, "spec.podConfig.buildConfig.timeout")
    }
}

/// Pod-level settings for the validation run
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    /// Image to run the notebook in when no build runs
    pub container_image: String,

    /// Service account for the validation pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,

    /// Container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ContainerResources>,

    /// Optional image build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_config: Option<BuildConfigSpec>,
}

fn positive_duration(raw: &str, field: &str) -> Result<Duration, Error> {
    let duration = parse_duration(raw)?;
    if duration.is_zero() {
        return Err(Error::validation(format!("{field} must be greater than zero")));
    }
    Ok(duration)
}

fn default_git_ref() -> String {
    "main".to_string()
}

fn default_strategy() -> String {
    DEFAULT_BUILD_STRATEGY.to_string()
}

fn default_base_image() -> String {
    DEFAULT_BASE_IMAGE.to_string()
}

fn default_build_timeout() -> String {
    DEFAULT_BUILD_TIMEOUT.to_string()
}

fn default_job_timeout() -> String {
    DEFAULT_JOB_TIMEOUT.to_string()
}

// =============================================================================
// CRD
// =============================================================================

/// Validates a Jupyter notebook, optionally building its image first
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mlops.dev",
    version = "v1alpha1",
    kind = "NotebookValidationJob",
    plural = "notebookvalidationjobs",
    shortname = "nvj",
    namespaced,
    status = "NotebookValidationJobStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Build","type":"string","jsonPath":".status.buildStatus.phase"}"#,
    printcolumn = r#"{"name":"Retries","type":"integer","jsonPath":".status.retryCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NotebookValidationJobSpec {
    /// Notebook to validate
    pub notebook: NotebookSource,

    /// Validation pod settings, including the optional build descriptor
    pub pod_config: PodConfig,

    /// Overall validation timeout (e.g., "30m")
    #[serde(default = "default_job_timeout")]
    pub timeout: String,
}

impl NotebookValidationJob {
    /// The build descriptor, if a build is requested and enabled
    pub fn build_config(&self) -> Option<&BuildConfigSpec> {
        self.spec
            .pod_config
            .build_config
            .as_ref()
            .filter(|b| b.enabled)
    }

    /// Current phase (Initializing when no status has been written)
    pub fn phase(&self) -> ValidationPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    /// Parsed overall timeout; zero is rejected
    pub fn timeout_duration(&self) -> Result<Duration, Error> {
        positive_duration(&self.spec.timeout, "spec.timeout")
    }
}

/// Name of the build trigger resource for a job
pub fn build_name(job_name: &str) -> String {
    format!("{job_name}-build")
}

/// Name of the validation pod for a job
pub fn validation_pod_name(job_name: &str) -> String {
    format!("{job_name}-validation")
}

// =============================================================================
// Status
// =============================================================================

/// Projection of the backend's build state onto the job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    /// Build phase
    #[serde(default)]
    pub phase: BuildPhase,

    /// Name of the backend's build resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_name: Option<String>,

    /// Strategy that ran the build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    /// Image produced by the build; immutable once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,

    /// When the build started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the build finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Backend message, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Status of a NotebookValidationJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotebookValidationJobStatus {
    /// Current phase of the job lifecycle
    #[serde(default)]
    pub phase: ValidationPhase,

    /// Build progress, present only once a build ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_status: Option<BuildStatus>,

    /// Observations, one per type
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Number of counted retries so far
    #[serde(default)]
    pub retry_count: u32,

    /// When the retry counter last moved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_time: Option<DateTime<Utc>>,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Image the validation runs with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_image: Option<String>,

    /// Name of the validation pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_pod_name: Option<String>,

    /// When processing started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the job reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Generation of the spec last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl NotebookValidationJobStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ValidationPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: ValidationPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Insert or update a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
