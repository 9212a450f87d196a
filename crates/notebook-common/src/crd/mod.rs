//! Custom Resource Definitions for the notebook validation operator

mod job;
mod types;

pub use job::{
    build_name, validation_pod_name, BuildConfigSpec, BuildPhase, BuildStatus,
    ContainerResources, EnvVarSpec, GitSource, NotebookSource, NotebookValidationJob,
    NotebookValidationJobSpec, NotebookValidationJobStatus, PodConfig, ValidationPhase,
    DEFAULT_BASE_IMAGE, DEFAULT_BUILD_STRATEGY, DEFAULT_BUILD_TIMEOUT, DEFAULT_JOB_TIMEOUT,
};
pub use types::{
    condition_types, find_condition, reasons, set_condition, Condition, ConditionStatus,
};
