//! Well-known labels and annotations
//!
//! Per-build resources are tied to their job by label rather than by owner
//! reference, so every object the operator creates carries the managed-by
//! label and, where it belongs to one job, the job label.

use std::collections::BTreeMap;

/// Standard Kubernetes managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on everything this operator creates
pub const MANAGED_BY_VALUE: &str = "notebook-validator";

/// Standard Kubernetes component label key
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// Label naming the job a resource belongs to
pub const JOB_LABEL: &str = "mlops.dev/notebook-validation-job";

/// Label naming the source secret a derived credential came from
pub const DERIVED_FROM_LABEL: &str = "mlops.dev/derived-from";

/// Label recording which task definition a namespace copy was made from
pub const TASK_TYPE_LABEL: &str = "mlops.dev/task-type";

/// Label recording the version of a namespace task copy
pub const TASK_VERSION_LABEL: &str = "mlops.dev/task-version";

/// Annotation recording where a task copy was taken from
pub const COPIED_FROM_ANNOTATION: &str = "mlops.dev/copied-from";

/// Annotation recording when a task copy was made or refreshed
pub const COPIED_AT_ANNOTATION: &str = "mlops.dev/copied-at";

/// Labels carried by every operator-created resource
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}

/// Labels for a resource that belongs to one job
pub fn job_labels(job_name: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = managed_labels();
    labels.insert(JOB_LABEL.to_string(), job_name.to_string());
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels
}

/// Label selector matching every resource that belongs to one job
pub fn job_selector(job_name: &str) -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{JOB_LABEL}={job_name}")
}

/// True if the labels mark an object as operator-managed
pub fn is_managed(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|l| l.get(MANAGED_BY_LABEL))
        .is_some_and(|v| v == MANAGED_BY_VALUE)
}
