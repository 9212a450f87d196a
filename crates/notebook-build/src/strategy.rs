//! Build strategy abstraction
//!
//! A [`BuildStrategy`] turns a job's repository into a container image using
//! one backend. The controller only sees [`BuildInfo`], a backend-neutral
//! projection of the backend's build object.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use kube::core::ErrorResponse;
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use notebook_common::crd::NotebookValidationJob;
use notebook_common::Error;

/// Phase of a backend build, normalized across backends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildInfoPhase {
    /// Accepted but not yet running
    Pending,
    /// Running
    Running,
    /// Finished and produced an image
    Complete,
    /// Finished without an image
    Failed,
    /// Stopped by a user or the backend
    Cancelled,
    /// Backend reported something unrecognised
    #[default]
    Unknown,
}

impl BuildInfoPhase {
    /// Precedence when choosing among several builds for one job
    fn rank(self) -> u8 {
        match self {
            Self::Complete => 5,
            Self::Running => 4,
            Self::Pending => 3,
            Self::Failed => 2,
            Self::Cancelled => 1,
            Self::Unknown => 0,
        }
    }

    /// True once the build can no longer change
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for BuildInfoPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Backend-neutral view of one build
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildInfo {
    /// Name of the backend build object
    pub name: String,
    /// Normalized phase
    pub phase: BuildInfoPhase,
    /// Image produced, once known
    pub image_reference: Option<String>,
    /// Backend message, verbatim
    pub message: Option<String>,
    /// When the backend started the build
    pub start_time: Option<DateTime<Utc>>,
    /// When the backend finished the build
    pub completion_time: Option<DateTime<Utc>>,
    /// Creation time of the build object
    pub created_at: Option<DateTime<Utc>>,
}

impl BuildInfo {
    /// Create info for a build in the given phase
    pub fn new(name: impl Into<String>, phase: BuildInfoPhase) -> Self {
        Self {
            name: name.into(),
            phase,
            ..Default::default()
        }
    }
}

/// A build backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BuildStrategy: Send + Sync {
    /// Name jobs select this backend by
    fn name(&self) -> &'static str;

    /// Whether the backend's APIs are served in the namespace
    async fn detect(&self, namespace: &str) -> Result<bool, Error>;

    /// Reject build descriptors this backend cannot run
    fn validate_config(&self, job: &NotebookValidationJob) -> Result<(), Error>;

    /// Trigger a build for the job.
    ///
    /// Idempotent: when the trigger resource already exists the current
    /// build is returned and nothing is duplicated.
    async fn create_build(&self, job: &NotebookValidationJob) -> Result<BuildInfo, Error>;

    /// Most relevant build for a job, found by label (see [`select_latest`])
    async fn get_latest_build(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Option<BuildInfo>, Error>;

    /// Build with exactly this name; NotFound when absent
    async fn get_build_status(&self, namespace: &str, build_name: &str)
        -> Result<BuildInfo, Error>;

    /// Delete finished builds of a job beyond the newest `keep`
    async fn cleanup_old_builds(
        &self,
        namespace: &str,
        job_name: &str,
        keep: usize,
    ) -> Result<(), Error>;

    /// Delete one build; a missing build is not an error
    async fn delete_build(&self, namespace: &str, build_name: &str) -> Result<(), Error>;
}

/// Numeric suffix of a generated build name (`nb-build-12` -> 12)
fn name_suffix(name: &str) -> Option<u64> {
    name.rsplit('-').next().and_then(|s| s.parse().ok())
}

fn recency(a: &BuildInfo, b: &BuildInfo) -> std::cmp::Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| name_suffix(&a.name).cmp(&name_suffix(&b.name)))
}

/// Pick the build that represents a job.
///
/// Phase precedence first (`Complete > Running > Pending > Failed >
/// Cancelled > Unknown`), then the newest creation time, then the highest
/// numeric name suffix.
pub fn select_latest(builds: Vec<BuildInfo>) -> Option<BuildInfo> {
    builds.into_iter().max_by(|a, b| {
        a.phase
            .rank()
            .cmp(&b.phase.rank())
            .then_with(|| recency(a, b))
    })
}

/// Names of finished builds older than the newest `keep`
pub fn builds_to_prune(mut builds: Vec<BuildInfo>, keep: usize) -> Vec<String> {
    builds.sort_by(|a, b| recency(b, a));
    builds
        .into_iter()
        .skip(keep)
        .filter(|b| b.phase.is_finished())
        .map(|b| b.name)
        .collect()
}

/// Namespace of a job; jobs are namespaced so this only fails on bad input
pub(crate) fn job_namespace(job: &NotebookValidationJob) -> Result<String, Error> {
    job.namespace().ok_or_else(|| {
        Error::validation_for_field(job.name_any(), "metadata.namespace", "job has no namespace")
    })
}

/// API-shaped NotFound error for exact-name lookups
pub(crate) fn not_found(kind: &str, name: &str) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{kind} \"{name}\" not found"),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

/// Parse an RFC 3339 timestamp at a JSON pointer into the object's data
pub(crate) fn time_at(obj: &DynamicObject, pointer: &str) -> Option<DateTime<Utc>> {
    obj.data
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// String at a JSON pointer into the object's data
pub(crate) fn str_at<'a>(obj: &'a DynamicObject, pointer: &str) -> Option<&'a str> {
    obj.data
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// Creation timestamp from object metadata
pub(crate) fn created_at(obj: &DynamicObject) -> Option<DateTime<Utc>> {
    obj.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Treat AlreadyExists on create as success
pub(crate) fn tolerate_already_exists<T>(result: Result<T, Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_already_exists() => Ok(None),
        Err(e) => Err(e),
    }
}
