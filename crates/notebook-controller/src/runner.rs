//! Notebook execution
//!
//! [`NotebookRunner`] executes a job's notebook in a given image and reports
//! progress without blocking. [`PodNotebookRunner`] runs it as a single pod:
//! an init container clones the repository (skipped for built images, which
//! already contain it) and papermill executes the notebook.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, ResourceRequirements, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use notebook_common::crd::{reasons, validation_pod_name, ContainerResources, NotebookValidationJob};
use notebook_common::labels::job_labels;
use notebook_common::Error;

use crate::pod_failure::analyze_pod;

/// Default image for the clone step
pub const DEFAULT_GIT_CLONE_IMAGE: &str = "alpine/git:latest";

/// Where built images carry the repository
pub const BUILT_SOURCE_DIR: &str = "/opt/app-root/src";

/// Where the clone step puts the repository
pub const CLONE_DIR: &str = "/workspace/repo";

const WORKSPACE_VOLUME: &str = "workspace";
const HOME_VOLUME: &str = "jovyan-home";
const HOME_DIR: &str = "/home/jovyan";
const VALIDATOR_CONTAINER: &str = "validator";

/// Clones with credentials served by an inline credential helper, so they
/// never appear in a URL or on a command line
const CLONE_SCRIPT: &str = r#"set -eu
if [ -n "${GIT_USERNAME:-}" ]; then
  GIT_SECRET="${GIT_PASSWORD:-${GIT_TOKEN:-}}"
  export GIT_SECRET
  exec git -c credential.helper='!f() { test "$1" = get || return 0; printf "username=%s\npassword=%s\n" "$GIT_USERNAME" "$GIT_SECRET"; }; f' \
    clone --depth 1 --branch "$GIT_REF" "$GIT_URL" /workspace/repo
fi
exec git clone --depth 1 --branch "$GIT_REF" "$GIT_URL" /workspace/repo
"#;

const PAPERMILL_SCRIPT: &str = r#"set -eu
command -v papermill >/dev/null 2>&1 || pip install --quiet papermill
papermill "$NOTEBOOK_PATH" /workspace/output.ipynb --log-output
"#;

/// Progress of a notebook execution
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Still running; poll again later
    InProgress,
    /// The notebook executed successfully
    Passed {
        /// Summary of the run
        diagnostics: String,
    },
    /// The notebook failed
    Failed {
        /// Machine-readable reason
        reason: String,
        /// What went wrong, as reported by the runtime
        diagnostics: String,
    },
}

/// Executes notebooks
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotebookRunner: Send + Sync {
    /// Start or poll the execution of the job's notebook in `image`
    async fn run(&self, job: &NotebookValidationJob, image: &str) -> Result<RunOutcome, Error>;
}

/// Pod operations needed by [`PodNotebookRunner`]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Get a pod by name
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;

    /// Delete a pod; a pod that is already gone is not an error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`PodClient`] backed by a kube `Client`
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if e.is_not_found() {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// Settings for validation pods
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerSettings {
    /// Image running the clone step
    pub git_clone_image: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            git_clone_image: DEFAULT_GIT_CLONE_IMAGE.to_string(),
        }
    }
}

/// Runs notebooks as pods named `{job}-validation`
pub struct PodNotebookRunner {
    pods: Arc<dyn PodClient>,
    settings: RunnerSettings,
}

impl PodNotebookRunner {
    /// Create a runner over the given pod client
    pub fn new(pods: Arc<dyn PodClient>, settings: RunnerSettings) -> Self {
        Self { pods, settings }
    }
}

#[async_trait]
impl NotebookRunner for PodNotebookRunner {
    async fn run(&self, job: &NotebookValidationJob, image: &str) -> Result<RunOutcome, Error> {
        let name = validation_pod_name(&job.name_any());
        let namespace = job
            .namespace()
            .ok_or_else(|| Error::validation("job has no namespace"))?;

        let owner_uid = job.uid().ok_or_else(|| {
            Error::internal_with_context("runner", format!("job {} has no uid", job.name_any()))
        })?;

        match self.pods.get_pod(&namespace, &name).await? {
            Some(pod) if owned_by(&pod, &owner_uid) => Ok(pod_outcome(&pod)),
            Some(pod) => {
                // Left behind by an earlier job of the same name
                if pod.metadata.deletion_timestamp.is_none() {
                    self.pods.delete_pod(&namespace, &name).await?;
                    info!(pod = %name, namespace = %namespace, "deleted stale validation pod");
                }
                Ok(RunOutcome::InProgress)
            }
            None => {
                let pod = validation_pod(job, image, &namespace, &self.settings)?;
                match self.pods.create_pod(&namespace, &pod).await {
                    Ok(()) => info!(pod = %name, namespace = %namespace, image, "created validation pod"),
                    Err(e) if e.is_already_exists() => debug!(pod = %name, "validation pod already exists"),
                    Err(e) => return Err(e),
                }
                Ok(RunOutcome::InProgress)
            }
        }
    }
}

fn owned_by(pod: &Pod, uid: &str) -> bool {
    pod.owner_references().iter().any(|owner| owner.uid == uid)
}

/// True when `image` was built from the job's repository
fn uses_built_image(job: &NotebookValidationJob, image: &str) -> bool {
    image != job.spec.pod_config.container_image
}

/// Path of the notebook inside the validation container
pub fn notebook_path(job: &NotebookValidationJob, image: &str) -> String {
    let root = if uses_built_image(job, image) {
        BUILT_SOURCE_DIR
    } else {
        CLONE_DIR
    };
    format!("{root}/{}", job.spec.notebook.path.trim_start_matches('/'))
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str, optional: bool) -> Result<EnvVar, Error> {
    Ok(serde_json::from_value(json!({
        "name": name,
        "valueFrom": {
            "secretKeyRef": { "name": secret, "key": key, "optional": optional },
        },
    }))?)
}

fn resource_requirements(resources: &ContainerResources) -> ResourceRequirements {
    let quantities = |m: &BTreeMap<String, String>| {
        (!m.is_empty()).then(|| {
            m.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect::<BTreeMap<_, _>>()
        })
    };
    ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..Default::default()
    }
}

fn clone_container(job: &NotebookValidationJob, settings: &RunnerSettings) -> Result<Container, Error> {
    let git = &job.spec.notebook.git;
    let mut env_vars = vec![env("GIT_URL", git.url.as_str()), env("GIT_REF", git.ref_.as_str())];
    if let Some(secret) = &git.credentials_secret {
        env_vars.push(secret_env("GIT_USERNAME", secret, "username", false)?);
        env_vars.push(secret_env("GIT_PASSWORD", secret, "password", true)?);
        env_vars.push(secret_env("GIT_TOKEN", secret, "token", true)?);
    }
    Ok(Container {
        name: "git-clone".to_string(),
        image: Some(settings.git_clone_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), CLONE_SCRIPT.to_string()]),
        env: Some(env_vars),
        volume_mounts: Some(vec![VolumeMount {
            name: WORKSPACE_VOLUME.to_string(),
            mount_path: "/workspace".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    })
}

/// The validation pod for a job
pub fn validation_pod(
    job: &NotebookValidationJob,
    image: &str,
    namespace: &str,
    settings: &RunnerSettings,
) -> Result<Pod, Error> {
    let job_name = job.name_any();
    let pod_config = &job.spec.pod_config;

    let mut env_vars = vec![
        env("NOTEBOOK_PATH", notebook_path(job, image)),
        env("HOME", HOME_DIR),
    ];
    env_vars.extend(pod_config.env.iter().map(|e| env(&e.name, e.value.as_str())));

    let validator = Container {
        name: VALIDATOR_CONTAINER.to_string(),
        image: Some(image.to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            PAPERMILL_SCRIPT.to_string(),
        ]),
        env: Some(env_vars),
        resources: pod_config.resources.as_ref().map(resource_requirements),
        volume_mounts: Some(vec![
            VolumeMount {
                name: WORKSPACE_VOLUME.to_string(),
                mount_path: "/workspace".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: HOME_VOLUME.to_string(),
                mount_path: HOME_DIR.to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let init_containers = if uses_built_image(job, image) {
        None
    } else {
        Some(vec![clone_container(job, settings)?])
    };

    let deadline = job
        .timeout_duration()
        .map_err(|e| Error::validation_for_field(&job_name, "spec.timeout", e.to_string()))?;
    let deadline_secs = i64::try_from(deadline.as_secs()).map_err(|_| {
        Error::validation_for_field(&job_name, "spec.timeout", "timeout is too large")
    })?;
    let owner = job.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context("runner", format!("job {job_name} has no uid"))
    })?;

    let empty_dir = |name: &str| Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(validation_pod_name(&job_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(job_labels(&job_name, "validation")),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            service_account_name: pod_config.service_account_name.clone(),
            active_deadline_seconds: Some(deadline_secs),
            init_containers,
            containers: vec![validator],
            volumes: Some(vec![empty_dir(WORKSPACE_VOLUME), empty_dir(HOME_VOLUME)]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Map a validation pod's state onto a run outcome.
///
/// A pod that is still Pending or Running fails early when its containers
/// show a failure the kubelet will not recover from.
pub fn pod_outcome(pod: &Pod) -> RunOutcome {
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref());
    if phase == Some("Succeeded") {
        return RunOutcome::Passed {
            diagnostics: "notebook executed successfully".to_string(),
        };
    }

    match (phase, analyze_pod(pod)) {
        (Some("Failed"), Some(failure)) => failure_outcome(failure.reason, failure.diagnostics()),
        (Some("Failed"), None) => validator_outcome(pod),
        (_, Some(failure)) if !failure.recoverable => {
            failure_outcome(failure.reason, failure.diagnostics())
        }
        (_, failure) => {
            if let Some(failure) = failure {
                debug!(reason = failure.reason, "validation pod waiting on a recoverable condition");
            }
            RunOutcome::InProgress
        }
    }
}

fn failure_outcome(reason: &str, diagnostics: String) -> RunOutcome {
    RunOutcome::Failed {
        reason: reason.to_string(),
        diagnostics,
    }
}

/// Outcome of a Failed pod whose containers point at nothing but the
/// notebook itself
fn validator_outcome(pod: &Pod) -> RunOutcome {
    let status = pod.status.as_ref();
    let terminated = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.name == VALIDATOR_CONTAINER))
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref());
    let reason = terminated
        .and_then(|t| t.reason.clone())
        .or_else(|| status.and_then(|s| s.reason.clone()))
        .unwrap_or_else(|| reasons::VALIDATION_FAILED.to_string());
    let diagnostics = terminated
        .and_then(|t| t.message.clone())
        .or_else(|| status.and_then(|s| s.message.clone()))
        .or_else(|| terminated.map(|t| format!("validator exited with code {}", t.exit_code)))
        .unwrap_or_else(|| "validation pod failed".to_string());
    failure_outcome(&reason, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
        PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use notebook_common::crd::{
        GitSource, NotebookSource, NotebookValidationJobSpec, PodConfig,
    };
    use std::sync::Mutex;

    const SPEC_IMAGE: &str = "quay.io/jupyter/scipy-notebook:latest";

    fn sample_job() -> NotebookValidationJob {
        let mut job = NotebookValidationJob::new(
            "churn",
            NotebookValidationJobSpec {
                notebook: NotebookSource {
                    git: GitSource {
                        url: "https://github.com/example/notebooks.git".to_string(),
                        ref_: "main".to_string(),
                        credentials_secret: Some("git-creds".to_string()),
                    },
                    path: "models/churn.ipynb".to_string(),
                },
                pod_config: PodConfig {
                    container_image: SPEC_IMAGE.to_string(),
                    service_account_name: None,
                    env: Vec::new(),
                    resources: Some(ContainerResources {
                        requests: BTreeMap::from([("cpu".to_string(), "500m".to_string())]),
                        limits: BTreeMap::new(),
                    }),
                    build_config: None,
                },
                timeout: "10m".to_string(),
            },
        );
        job.metadata.namespace = Some("ds".to_string());
        job.metadata.uid = Some("u-1".to_string());
        job
    }

    fn owned(mut pod: Pod, uid: &str) -> Pod {
        pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "mlops.dev/v1alpha1".to_string(),
            kind: "NotebookValidationJob".to_string(),
            name: "churn".to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        pod
    }

    fn failed_pod(reason: Option<&str>, message: Option<&str>, exit_code: i32) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some("Failed".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: VALIDATOR_CONTAINER.to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code,
                            reason: reason.map(str::to_string),
                            message: message.map(str::to_string),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn spec_image_clones_the_repository() {
        let job = sample_job();
        let pod = validation_pod(&job, SPEC_IMAGE, "ds", &RunnerSettings::default()).unwrap();
        let spec = pod.spec.unwrap();

        let init = spec.init_containers.unwrap();
        assert_eq!(init.len(), 1);
        let command = init[0].command.as_ref().unwrap().join(" ");
        assert!(!command.contains("git-creds"), "credentials must not be inlined");
        let env = init[0].env.as_ref().unwrap();
        let username = env.iter().find(|e| e.name == "GIT_USERNAME").unwrap();
        assert!(username.value.is_none());
        assert!(username.value_from.as_ref().unwrap().secret_key_ref.is_some());

        let validator = &spec.containers[0];
        let notebook = validator
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "NOTEBOOK_PATH")
            .unwrap();
        assert_eq!(
            notebook.value.as_deref(),
            Some("/workspace/repo/models/churn.ipynb")
        );
        assert_eq!(spec.active_deadline_seconds, Some(600));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));

        let owners = pod.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "u-1");
        assert_eq!(owners[0].kind, "NotebookValidationJob");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(
            validator.resources.as_ref().unwrap().requests.as_ref().unwrap()["cpu"],
            Quantity("500m".to_string())
        );
    }

    #[test]
    fn built_image_skips_clone_and_uses_image_source_dir() {
        let job = sample_job();
        let image = "registry/ds/churn-build:latest@sha256:abc";
        let pod = validation_pod(&job, image, "ds", &RunnerSettings::default()).unwrap();
        let spec = pod.spec.unwrap();

        assert!(spec.init_containers.is_none());
        assert_eq!(spec.containers[0].image.as_deref(), Some(image));
        assert_eq!(
            notebook_path(&job, image),
            "/opt/app-root/src/models/churn.ipynb"
        );
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels["app.kubernetes.io/managed-by"], "notebook-validator");
    }

    #[test]
    fn pod_phases_map_to_outcomes() {
        let running = Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(pod_outcome(&running), RunOutcome::InProgress);
        assert_eq!(pod_outcome(&Pod::default()), RunOutcome::InProgress);

        let succeeded = Pod {
            status: Some(PodStatus {
                phase: Some("Succeeded".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(pod_outcome(&succeeded), RunOutcome::Passed { .. }));
    }

    #[test]
    fn failed_pod_reports_terminated_reason() {
        let RunOutcome::Failed { reason, diagnostics } =
            pod_outcome(&failed_pod(Some("OOMKilled"), None, 137))
        else {
            panic!("expected failure");
        };
        assert_eq!(reason, "OOMKilled");
        assert!(diagnostics.contains("exit code 137"), "{diagnostics}");
        assert!(diagnostics.contains("podConfig.resources"), "{diagnostics}");

        let RunOutcome::Failed { reason, diagnostics } =
            pod_outcome(&failed_pod(None, Some("PapermillExecutionError: cell 4"), 1))
        else {
            panic!("expected failure");
        };
        assert_eq!(reason, reasons::VALIDATION_FAILED);
        assert_eq!(diagnostics, "PapermillExecutionError: cell 4");
    }

    #[tokio::test]
    async fn story_first_run_creates_pod_then_polls_it() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let created_clone = created.clone();

        let mut pods = MockPodClient::new();
        pods.expect_get_pod().times(1).returning(|_, _| Ok(None));
        pods.expect_create_pod().returning(move |_, pod| {
            created_clone.lock().unwrap().push(pod.clone());
            Ok(())
        });

        let runner = PodNotebookRunner::new(Arc::new(pods), RunnerSettings::default());
        let outcome = runner.run(&sample_job(), SPEC_IMAGE).await.unwrap();
        assert_eq!(outcome, RunOutcome::InProgress);
        assert_eq!(
            created.lock().unwrap()[0].metadata.name.as_deref(),
            Some("churn-validation")
        );
    }

    #[tokio::test]
    async fn story_existing_pod_is_polled_not_recreated() {
        let mut pods = MockPodClient::new();
        pods.expect_get_pod()
            .returning(|_, _| Ok(Some(owned(failed_pod(Some("Error"), Some("cell 2 raised"), 1), "u-1"))));
        pods.expect_create_pod().never();

        let runner = PodNotebookRunner::new(Arc::new(pods), RunnerSettings::default());
        let outcome = runner.run(&sample_job(), SPEC_IMAGE).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                reason: "Error".to_string(),
                diagnostics: "cell 2 raised".to_string(),
            }
        );
    }

    #[test]
    fn clone_credentials_never_touch_the_url() {
        assert!(CLONE_SCRIPT.contains("credential.helper"));
        assert!(!CLONE_SCRIPT.contains("sed"));
        assert!(CLONE_SCRIPT.contains(r#""$GIT_URL""#));
    }

    #[test]
    fn oversized_timeout_is_rejected() {
        let mut job = sample_job();
        job.spec.timeout = u64::MAX.to_string();
        let err = validation_pod(&job, SPEC_IMAGE, "ds", &RunnerSettings::default()).unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
    }

    fn pending_with(init: Option<ContainerStatus>, validator: ContainerStatus) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                init_container_statuses: init.map(|c| vec![c]),
                container_statuses: Some(vec![validator]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn waiting(name: &str, reason: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    message: Some(format!("{reason} from kubelet")),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn unpullable_image_fails_without_waiting_for_the_deadline() {
        for reason in ["ImagePullBackOff", "InvalidImageName", "CreateContainerConfigError"] {
            let pod = pending_with(None, waiting(VALIDATOR_CONTAINER, reason));
            let RunOutcome::Failed { reason: got, diagnostics } = pod_outcome(&pod) else {
                panic!("{reason} should fail the run");
            };
            assert_eq!(got, reason);
            assert!(diagnostics.contains("container validator"), "{diagnostics}");
        }

        let retrying = pending_with(None, waiting(VALIDATOR_CONTAINER, "ErrImagePull"));
        assert_eq!(pod_outcome(&retrying), RunOutcome::InProgress);
    }

    #[test]
    fn failed_clone_step_fails_the_run() {
        let clone = ContainerStatus {
            name: "git-clone".to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: 128,
                    reason: Some("Error".to_string()),
                    message: Some("fatal: Remote branch nope not found".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let pod = pending_with(Some(clone), waiting(VALIDATOR_CONTAINER, "PodInitializing"));

        let RunOutcome::Failed { reason, diagnostics } = pod_outcome(&pod) else {
            panic!("expected failure");
        };
        assert_eq!(reason, "InitContainerError");
        assert!(diagnostics.starts_with("init container git-clone"), "{diagnostics}");
        assert!(diagnostics.contains("Remote branch nope not found"), "{diagnostics}");
    }

    /// Story: a job was deleted and recreated under the same name while its
    /// old pod lingers. The old result is not adopted; the pod is deleted and
    /// a fresh one is created on a later poll.
    #[tokio::test]
    async fn story_pod_from_a_previous_job_is_replaced() {
        let mut pods = MockPodClient::new();
        pods.expect_get_pod()
            .returning(|_, _| Ok(Some(owned(failed_pod(Some("Error"), None, 1), "u-0"))));
        pods.expect_delete_pod()
            .withf(|ns, name| ns == "ds" && name == "churn-validation")
            .times(1)
            .returning(|_, _| Ok(()));
        pods.expect_create_pod().never();

        let runner = PodNotebookRunner::new(Arc::new(pods), RunnerSettings::default());
        let outcome = runner.run(&sample_job(), SPEC_IMAGE).await.unwrap();
        assert_eq!(outcome, RunOutcome::InProgress);
    }

    #[tokio::test]
    async fn terminating_stale_pod_is_left_to_finish() {
        let mut stale = owned(failed_pod(Some("Error"), None, 1), "u-0");
        stale.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let mut pods = MockPodClient::new();
        pods.expect_get_pod()
            .returning(move |_, _| Ok(Some(stale.clone())));
        pods.expect_delete_pod().never();
        pods.expect_create_pod().never();

        let runner = PodNotebookRunner::new(Arc::new(pods), RunnerSettings::default());
        let outcome = runner.run(&sample_job(), SPEC_IMAGE).await.unwrap();
        assert_eq!(outcome, RunOutcome::InProgress);
    }
}
