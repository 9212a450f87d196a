//! Shared fixtures for controller tests

use async_trait::async_trait;
use kube::core::ErrorResponse;
use mockall::mock;

use notebook_build::{BuildInfo, BuildStrategy, StrategyRegistry};
use notebook_common::crd::{
    BuildConfigSpec, GitSource, NotebookSource, NotebookValidationJob, NotebookValidationJobSpec,
    PodConfig,
};
use notebook_common::Error;

pub(crate) const SPEC_IMAGE: &str = "quay.io/jupyter/scipy-notebook:latest";

mock! {
    pub Strategy {}

    #[async_trait]
    impl BuildStrategy for Strategy {
        fn name(&self) -> &'static str;
        async fn detect(&self, namespace: &str) -> Result<bool, Error>;
        fn validate_config(&self, job: &NotebookValidationJob) -> Result<(), Error>;
        async fn create_build(&self, job: &NotebookValidationJob) -> Result<BuildInfo, Error>;
        async fn get_latest_build(
            &self,
            namespace: &str,
            job_name: &str,
        ) -> Result<Option<BuildInfo>, Error>;
        async fn get_build_status(&self, namespace: &str, build_name: &str)
            -> Result<BuildInfo, Error>;
        async fn cleanup_old_builds(
            &self,
            namespace: &str,
            job_name: &str,
            keep: usize,
        ) -> Result<(), Error>;
        async fn delete_build(&self, namespace: &str, build_name: &str) -> Result<(), Error>;
    }
}

/// Job "churn" in namespace "ds" at resourceVersion 7, building with
/// `strategy` when given
pub(crate) fn job(strategy: Option<&str>) -> NotebookValidationJob {
    let mut job = NotebookValidationJob::new(
        "churn",
        NotebookValidationJobSpec {
            notebook: NotebookSource {
                git: GitSource {
                    url: "https://github.com/example/notebooks.git".to_string(),
                    ref_: "main".to_string(),
                    credentials_secret: None,
                },
                path: "models/churn.ipynb".to_string(),
            },
            pod_config: PodConfig {
                container_image: SPEC_IMAGE.to_string(),
                service_account_name: None,
                env: Vec::new(),
                resources: None,
                build_config: strategy.map(|s| BuildConfigSpec {
                    enabled: true,
                    strategy: s.to_string(),
                    ..Default::default()
                }),
            },
            timeout: "30m".to_string(),
        },
    );
    job.metadata.namespace = Some("ds".to_string());
    job.metadata.resource_version = Some("7".to_string());
    job.metadata.generation = Some(1);
    job
}

/// Registry holding one mocked strategy under the name it reports
pub(crate) fn registry_with(strategy: MockStrategy) -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.register(std::sync::Arc::new(strategy));
    registry
}

pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} from test"),
        reason: reason.to_string(),
        code,
    }))
}
