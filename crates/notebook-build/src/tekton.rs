//! Tekton pipeline builds
//!
//! A job gets a Pipeline `{job}-pipeline` (clone, optionally generate a
//! Dockerfile, buildah) and one PipelineRun `{job}-build` bound to a
//! per-build workspace volume. The run name is deterministic, so creation is
//! idempotent by name; lookups still go through the job label.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use notebook_common::crd::{build_name, BuildConfigSpec, NotebookValidationJob};
use notebook_common::labels::{job_labels, JOB_LABEL};
use notebook_common::Error;

use crate::client::{kinds, BuildClient};
use crate::credentials::{ensure_backend_credential, BackendKind};
use crate::resources::{ensure_build_volume, ensure_namespace_resources, BUILDAH_TASK, GIT_CLONE_TASK};
use crate::settings::BuildSettings;
use crate::strategy::{
    builds_to_prune, created_at, job_namespace, not_found, select_latest, time_at,
    tolerate_already_exists, BuildInfo, BuildInfoPhase, BuildStrategy,
};

/// Strategy name
pub const TEKTON_STRATEGY: &str = "tekton";

/// `strategyConfig` key overriding the push registry
pub const REGISTRY_KEY: &str = "registry";

/// Pipeline result carrying the pushed image
const IMAGE_URL_RESULT: &str = "IMAGE_URL";

/// Pipeline result carrying the pushed image's digest
const IMAGE_DIGEST_RESULT: &str = "IMAGE_DIGEST";

/// Image running the Dockerfile generation step
pub const GENERATOR_IMAGE: &str = "registry.access.redhat.com/ubi9/ubi-minimal:latest";

/// Group buildah runs as; the workspace volume must be writable by it
const BUILD_FS_GROUP: i64 = 65532;

/// Dockerfile path used when the job does not bring its own
const GENERATED_DOCKERFILE: &str = "./Dockerfile";

/// Writes a Dockerfile that layers the repository onto the base image
const GENERATE_DOCKERFILE_SCRIPT: &str = r#"#!/bin/sh
set -eu
cd "$(workspaces.source.path)"
cat > Dockerfile <<EOF
FROM $(params.base-image)
COPY . /opt/app-root/src/
WORKDIR /opt/app-root/src
EOF
if [ -f requirements.txt ]; then
  echo 'RUN pip install --no-cache-dir -r requirements.txt' >> Dockerfile
fi
cat Dockerfile
"#;

/// Tekton backend
pub struct TektonStrategy {
    client: Arc<dyn BuildClient>,
    settings: BuildSettings,
}

impl TektonStrategy {
    /// Create the backend over the given client
    pub fn new(client: Arc<dyn BuildClient>, settings: BuildSettings) -> Self {
        Self { client, settings }
    }

    /// Image a job's build pushes to
    pub fn image_reference(&self, namespace: &str, job_name: &str, build: &BuildConfigSpec) -> String {
        let registry = build
            .strategy_config
            .get(REGISTRY_KEY)
            .map(String::as_str)
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.settings.default_registry);
        format!(
            "{}/{namespace}/{}:latest",
            registry.trim_end_matches('/'),
            build_name(job_name)
        )
    }

    async fn ensure_pipeline(
        &self,
        namespace: &str,
        job_name: &str,
        build: &BuildConfigSpec,
    ) -> Result<(), Error> {
        let ar = kinds::pipeline();
        let name = pipeline_name(job_name);
        if self.client.get_object(&ar, namespace, &name).await?.is_some() {
            return Ok(());
        }
        let pipeline = pipeline_object(namespace, job_name, build)?;
        if tolerate_already_exists(self.client.create_object(&ar, namespace, &pipeline).await)?
            .is_some()
        {
            info!(pipeline = %name, namespace, "created pipeline");
        }
        Ok(())
    }

    async fn list_runs(&self, namespace: &str, job_name: &str) -> Result<Vec<BuildInfo>, Error> {
        let selector = format!("{JOB_LABEL}={job_name}");
        let runs = self
            .client
            .list_objects(&kinds::pipeline_run(), namespace, &selector)
            .await?;
        Ok(runs.iter().map(run_info).collect())
    }
}

/// Name of a job's Pipeline
pub fn pipeline_name(job_name: &str) -> String {
    format!("{job_name}-pipeline")
}

fn param(name: &str, value: impl Into<Value>) -> Value {
    json!({ "name": name, "value": value.into() })
}

fn pipeline_object(
    namespace: &str,
    job_name: &str,
    build: &BuildConfigSpec,
) -> Result<DynamicObject, Error> {
    let ar = kinds::pipeline();
    let generate = build.dockerfile.is_none();

    let mut tasks = vec![json!({
        "name": "fetch-repository",
        "taskRef": { "name": GIT_CLONE_TASK, "kind": "Task" },
        "params": [
            param("URL", "$(params.git-url)"),
            param("REVISION", "$(params.git-revision)"),
            param("DELETE_EXISTING", "true"),
        ],
        "workspaces": [
            { "name": "output", "workspace": "shared-workspace" },
            { "name": "basic-auth", "workspace": "git-credentials" },
        ],
    })];

    if generate {
        tasks.push(json!({
            "name": "generate-dockerfile",
            "runAfter": ["fetch-repository"],
            "params": [param("base-image", "$(params.base-image)")],
            "workspaces": [{ "name": "source", "workspace": "shared-workspace" }],
            "taskSpec": {
                "params": [{ "name": "base-image", "type": "string" }],
                "workspaces": [{ "name": "source" }],
                "steps": [{
                    "name": "generate",
                    "image": GENERATOR_IMAGE,
                    "script": GENERATE_DOCKERFILE_SCRIPT,
                }],
            },
        }));
    }

    let build_after = if generate {
        "generate-dockerfile"
    } else {
        "fetch-repository"
    };
    tasks.push(json!({
        "name": "build-image",
        "runAfter": [build_after],
        "taskRef": { "name": BUILDAH_TASK, "kind": "Task" },
        "params": [
            param("IMAGE", "$(params.image-reference)"),
            param("DOCKERFILE", "$(params.dockerfile-path)"),
            param("CONTEXT", "."),
        ],
        "workspaces": [{ "name": "source", "workspace": "shared-workspace" }],
    }));

    serde_json::from_value(json!({
        "apiVersion": ar.api_version,
        "kind": ar.kind,
        "metadata": {
            "name": pipeline_name(job_name),
            "namespace": namespace,
            "labels": job_labels(job_name, "build"),
        },
        "spec": {
            "params": [
                { "name": "git-url", "type": "string" },
                { "name": "git-revision", "type": "string", "default": "main" },
                { "name": "image-reference", "type": "string" },
                { "name": "base-image", "type": "string" },
                { "name": "dockerfile-path", "type": "string", "default": GENERATED_DOCKERFILE },
            ],
            "workspaces": [
                { "name": "shared-workspace" },
                { "name": "git-credentials", "optional": true },
            ],
            "tasks": tasks,
            "results": [
                { "name": IMAGE_URL_RESULT, "value": "$(tasks.build-image.results.IMAGE_URL)" },
                { "name": IMAGE_DIGEST_RESULT, "value": "$(tasks.build-image.results.IMAGE_DIGEST)" },
            ],
        },
    }))
    .map_err(|e| Error::serialization_for_kind(&ar.kind, e.to_string()))
}

struct RunInputs<'a> {
    namespace: &'a str,
    image: &'a str,
    volume: &'a str,
    credentials: Option<&'a str>,
    service_account: &'a str,
}

fn pipeline_run_object(
    job: &NotebookValidationJob,
    build: &BuildConfigSpec,
    inputs: &RunInputs<'_>,
) -> Result<DynamicObject, Error> {
    let ar = kinds::pipeline_run();
    let job_name = job.name_any();
    let git = &job.spec.notebook.git;
    // Tekton wants a Go duration; bare numbers are seconds here
    let timeout = format!("{}s", build.timeout_duration()?.as_secs());

    let mut workspaces = vec![json!({
        "name": "shared-workspace",
        "persistentVolumeClaim": { "claimName": inputs.volume },
    })];
    if let Some(secret) = inputs.credentials {
        workspaces.push(json!({
            "name": "git-credentials",
            "secret": { "secretName": secret },
        }));
    }

    serde_json::from_value(json!({
        "apiVersion": ar.api_version,
        "kind": ar.kind,
        "metadata": {
            "name": build_name(&job_name),
            "namespace": inputs.namespace,
            "labels": job_labels(&job_name, "build"),
        },
        "spec": {
            "pipelineRef": { "name": pipeline_name(&job_name) },
            "params": [
                param("git-url", git.url.as_str()),
                param("git-revision", git.ref_.as_str()),
                param("image-reference", inputs.image),
                param("base-image", build.base_image.as_str()),
                param(
                    "dockerfile-path",
                    build.dockerfile.as_deref().unwrap_or(GENERATED_DOCKERFILE),
                ),
            ],
            "timeouts": { "pipeline": timeout },
            "taskRunTemplate": {
                "serviceAccountName": inputs.service_account,
                "podTemplate": { "securityContext": { "fsGroup": BUILD_FS_GROUP } },
            },
            "workspaces": workspaces,
        },
    }))
    .map_err(|e| Error::serialization_for_kind(&ar.kind, e.to_string()))
}

/// The `Succeeded` condition of a run, if reported
fn succeeded_condition(run: &DynamicObject) -> Option<&Value> {
    run.data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .and_then(|conds| conds.iter().find(|c| c["type"] == "Succeeded"))
}

fn run_phase(run: &DynamicObject) -> BuildInfoPhase {
    let Some(cond) = succeeded_condition(run) else {
        return BuildInfoPhase::Pending;
    };
    match cond["status"].as_str() {
        Some("True") => BuildInfoPhase::Complete,
        Some("False") => {
            let cancelled = cond["reason"]
                .as_str()
                .is_some_and(|r| r.starts_with("Cancelled"));
            if cancelled {
                BuildInfoPhase::Cancelled
            } else {
                BuildInfoPhase::Failed
            }
        }
        Some("Unknown") => BuildInfoPhase::Running,
        _ => BuildInfoPhase::Unknown,
    }
}

fn pipeline_result(run: &DynamicObject, name: &str) -> Option<String> {
    ["/status/results", "/status/pipelineResults"]
        .iter()
        .filter_map(|p| run.data.pointer(p).and_then(Value::as_array))
        .flatten()
        .find(|r| r["name"] == name)
        .and_then(|r| r["value"].as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// The pushed image, digest-qualified when buildah reported one
fn image_url_result(run: &DynamicObject) -> Option<String> {
    let url = pipeline_result(run, IMAGE_URL_RESULT)?;
    match pipeline_result(run, IMAGE_DIGEST_RESULT) {
        Some(digest) if !url.contains('@') => Some(format!("{url}@{digest}")),
        _ => Some(url),
    }
}

/// Project a PipelineRun onto [`BuildInfo`]
fn run_info(run: &DynamicObject) -> BuildInfo {
    let phase = run_phase(run);
    let image_reference = image_url_result(run).or_else(|| {
        // Fall back to the image we asked buildah to push
        (phase == BuildInfoPhase::Complete)
            .then(|| run_param(run, "image-reference"))
            .flatten()
    });
    BuildInfo {
        name: run.name_any(),
        phase,
        image_reference,
        message: succeeded_condition(run)
            .and_then(|c| c["message"].as_str())
            .filter(|m| !m.is_empty())
            .map(str::to_string),
        start_time: time_at(run, "/status/startTime"),
        completion_time: time_at(run, "/status/completionTime"),
        created_at: created_at(run),
    }
}

fn run_param(run: &DynamicObject, name: &str) -> Option<String> {
    run.data
        .pointer("/spec/params")
        .and_then(Value::as_array)?
        .iter()
        .find(|p| p["name"] == name)
        .and_then(|p| p["value"].as_str())
        .map(str::to_string)
}

#[async_trait]
impl BuildStrategy for TektonStrategy {
    fn name(&self) -> &'static str {
        TEKTON_STRATEGY
    }

    async fn detect(&self, namespace: &str) -> Result<bool, Error> {
        self.client.api_available(&kinds::pipeline(), namespace).await
    }

    fn validate_config(&self, job: &NotebookValidationJob) -> Result<(), Error> {
        let job_name = job.name_any();
        if job.spec.notebook.git.url.trim().is_empty() {
            return Err(Error::validation_for_field(
                job_name,
                "spec.notebook.git.url",
                "tekton builds need a git repository URL",
            ));
        }
        let Some(build) = job.build_config() else {
            return Ok(());
        };
        if let Some(path) = &build.dockerfile {
            let escapes = path.split('/').any(|part| part == "..");
            if path.starts_with('/') || escapes {
                return Err(Error::validation_for_field(
                    job_name,
                    "spec.podConfig.buildConfig.dockerfile",
                    format!("dockerfile must be a path inside the repository, got {path}"),
                ));
            }
        }
        build.timeout_duration().map_err(|e| {
            Error::validation_for_field(
                &job_name,
                "spec.podConfig.buildConfig.timeout",
                e.to_string(),
            )
        })?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job = %job.name_any(), strategy = TEKTON_STRATEGY))]
    async fn create_build(&self, job: &NotebookValidationJob) -> Result<BuildInfo, Error> {
        let namespace = job_namespace(job)?;
        let job_name = job.name_any();
        let run_name = build_name(&job_name);
        let build = job.build_config().ok_or_else(|| {
            Error::validation_for_field(
                &job_name,
                "spec.podConfig.buildConfig.enabled",
                "build is not enabled",
            )
        })?;

        let run_ar = kinds::pipeline_run();
        if let Some(existing) = self.client.get_object(&run_ar, &namespace, &run_name).await? {
            debug!(build = %run_name, "pipeline run already exists");
            return Ok(run_info(&existing));
        }

        let client = self.client.as_ref();
        ensure_namespace_resources(client, &self.settings, &namespace).await?;
        let volume =
            ensure_build_volume(client, &self.settings, &namespace, &job_name, &run_name).await?;

        let git = &job.spec.notebook.git;
        let credentials = match &git.credentials_secret {
            Some(secret) => Some(
                ensure_backend_credential(client, &namespace, secret, BackendKind::Tekton, &git.url)
                    .await?,
            ),
            None => None,
        };

        self.ensure_pipeline(&namespace, &job_name, build).await?;

        let image = self.image_reference(&namespace, &job_name, build);
        let run = pipeline_run_object(
            job,
            build,
            &RunInputs {
                namespace: &namespace,
                image: &image,
                volume: &volume,
                credentials: credentials.as_deref(),
                service_account: &self.settings.service_account,
            },
        )?;

        match tolerate_already_exists(self.client.create_object(&run_ar, &namespace, &run).await)? {
            Some(created) => {
                info!(build = %run_name, namespace = %namespace, image = %image, "created pipeline run");
                Ok(run_info(&created))
            }
            None => self.get_build_status(&namespace, &run_name).await,
        }
    }

    async fn get_latest_build(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Option<BuildInfo>, Error> {
        Ok(select_latest(self.list_runs(namespace, job_name).await?))
    }

    async fn get_build_status(
        &self,
        namespace: &str,
        build_name: &str,
    ) -> Result<BuildInfo, Error> {
        self.client
            .get_object(&kinds::pipeline_run(), namespace, build_name)
            .await?
            .map(|r| run_info(&r))
            .ok_or_else(|| not_found("PipelineRun", build_name))
    }

    async fn cleanup_old_builds(
        &self,
        namespace: &str,
        job_name: &str,
        keep: usize,
    ) -> Result<(), Error> {
        for name in builds_to_prune(self.list_runs(namespace, job_name).await?, keep) {
            self.delete_build(namespace, &name).await?;
        }
        Ok(())
    }

    async fn delete_build(&self, namespace: &str, build_name: &str) -> Result<(), Error> {
        self.client
            .delete_object(&kinds::pipeline_run(), namespace, build_name)
            .await?;
        info!(build = build_name, namespace, "deleted pipeline run");
        Ok(())
    }
}
