//! Operator-wide build settings

/// Registry Tekton builds push to unless the job overrides it
pub const DEFAULT_REGISTRY: &str = "image-registry.openshift-image-registry.svc:5000";

/// Namespace the pipeline tasks are copied from
pub const DEFAULT_TASK_SOURCE_NAMESPACE: &str = "openshift-pipelines";

/// Version stamped on namespace task copies; bump to force a refresh
pub const DEFAULT_TASK_VERSION: &str = "1.0.0";

/// Service account pipeline runs execute as
pub const DEFAULT_SERVICE_ACCOUNT: &str = "pipeline";

/// Security profile granted to the build service account
pub const DEFAULT_SCC_NAME: &str = "pipelines-scc";

/// Size of the per-build workspace volume
pub const DEFAULT_VOLUME_SIZE: &str = "1Gi";

/// Settings shared by every build in the cluster
#[derive(Clone, Debug, PartialEq)]
pub struct BuildSettings {
    /// Namespace holding the source copies of `git-clone` and `buildah`
    pub task_source_namespace: String,
    /// Value of the task-version label on namespace copies
    pub task_version: String,
    /// Service account for pipeline runs
    pub service_account: String,
    /// SecurityContextConstraints granted to the service account
    pub scc_name: String,
    /// Requested size of each build workspace volume
    pub volume_size: String,
    /// Storage class for build workspace volumes; cluster default when unset
    pub storage_class: Option<String>,
    /// Registry used when the job does not set `strategyConfig.registry`
    pub default_registry: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            task_source_namespace: DEFAULT_TASK_SOURCE_NAMESPACE.to_string(),
            task_version: DEFAULT_TASK_VERSION.to_string(),
            service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
            scc_name: DEFAULT_SCC_NAME.to_string(),
            volume_size: DEFAULT_VOLUME_SIZE.to_string(),
            storage_class: None,
            default_registry: DEFAULT_REGISTRY.to_string(),
        }
    }
}
