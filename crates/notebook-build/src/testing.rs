//! Shared fixtures for backend tests

use kube::api::DynamicObject;
use kube::core::ErrorResponse;

use notebook_common::crd::{
    BuildConfigSpec, GitSource, NotebookSource, NotebookValidationJob, NotebookValidationJobSpec,
    PodConfig,
};
use notebook_common::Error;

pub(crate) const GIT_URL: &str = "https://github.com/example/notebooks.git";

/// A namespaced job with the build enabled for `strategy`
pub(crate) fn job(name: &str, strategy: &str) -> NotebookValidationJob {
    let mut job = NotebookValidationJob::new(
        name,
        NotebookValidationJobSpec {
            notebook: NotebookSource {
                git: GitSource {
                    url: GIT_URL.to_string(),
                    ref_: "main".to_string(),
                    credentials_secret: None,
                },
                path: "models/churn.ipynb".to_string(),
            },
            pod_config: PodConfig {
                container_image: "quay.io/jupyter/scipy-notebook:latest".to_string(),
                service_account_name: None,
                env: Vec::new(),
                resources: None,
                build_config: Some(BuildConfigSpec {
                    enabled: true,
                    strategy: strategy.to_string(),
                    ..Default::default()
                }),
            },
            timeout: "30m".to_string(),
        },
    );
    job.metadata.namespace = Some("ds".to_string());
    job
}

pub(crate) fn object(value: serde_json::Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} from test"),
        reason: reason.to_string(),
        code,
    }))
}
