//! Source-to-Image builds on OpenShift
//!
//! Each job gets an ImageStream and a BuildConfig named `{job}-build`. Builds
//! are triggered through the BuildConfig's `instantiate` subresource, so the
//! API server names them `{job}-build-{n}` and labels them with
//! `buildconfig={job}-build`, which is how they are found again.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, instrument};

use notebook_common::crd::{build_name, BuildConfigSpec, NotebookValidationJob};
use notebook_common::labels::job_labels;
use notebook_common::Error;

use crate::client::{kinds, BuildClient};
use crate::credentials::{ensure_backend_credential, BackendKind};
use crate::strategy::{
    builds_to_prune, created_at, job_namespace, not_found, select_latest, str_at, time_at,
    tolerate_already_exists, BuildInfo, BuildInfoPhase, BuildStrategy,
};

/// Strategy name
pub const S2I_STRATEGY: &str = "s2i";

/// Label OpenShift puts on builds started from a BuildConfig
const BUILD_CONFIG_LABEL: &str = "buildconfig";

/// Source-to-Image backend
pub struct S2iStrategy {
    client: Arc<dyn BuildClient>,
}

impl S2iStrategy {
    /// Create the backend over the given client
    pub fn new(client: Arc<dyn BuildClient>) -> Self {
        Self { client }
    }

    async fn ensure_image_stream(&self, namespace: &str, job_name: &str) -> Result<(), Error> {
        let ar = kinds::image_stream();
        let name = build_name(job_name);
        if self.client.get_object(&ar, namespace, &name).await?.is_some() {
            return Ok(());
        }
        let stream: DynamicObject = serde_json::from_value(json!({
            "apiVersion": ar.api_version,
            "kind": ar.kind,
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": job_labels(job_name, "build"),
            },
            "spec": { "lookupPolicy": { "local": true } },
        }))?;
        tolerate_already_exists(self.client.create_object(&ar, namespace, &stream).await)?;
        Ok(())
    }

    async fn ensure_build_config(
        &self,
        namespace: &str,
        job: &NotebookValidationJob,
        build: &BuildConfigSpec,
        source_secret: Option<&str>,
    ) -> Result<(), Error> {
        let ar = kinds::build_config();
        let name = build_name(&job.name_any());
        if self.client.get_object(&ar, namespace, &name).await?.is_some() {
            debug!(build_config = %name, namespace, "build config already exists");
            return Ok(());
        }
        let desired = build_config_object(namespace, job, build, source_secret)?;
        if tolerate_already_exists(self.client.create_object(&ar, namespace, &desired).await)?
            .is_some()
        {
            info!(build_config = %name, namespace, "created build config");
        }
        Ok(())
    }

    async fn list_builds(&self, namespace: &str, job_name: &str) -> Result<Vec<BuildInfo>, Error> {
        let selector = format!("{BUILD_CONFIG_LABEL}={}", build_name(job_name));
        let builds = self
            .client
            .list_objects(&kinds::build(), namespace, &selector)
            .await?;
        Ok(builds.iter().map(build_info).collect())
    }
}

/// Desired BuildConfig for a job
fn build_config_object(
    namespace: &str,
    job: &NotebookValidationJob,
    build: &BuildConfigSpec,
    source_secret: Option<&str>,
) -> Result<DynamicObject, Error> {
    let ar = kinds::build_config();
    let job_name = job.name_any();
    let name = build_name(&job_name);
    let git = &job.spec.notebook.git;

    let mut source = json!({
        "type": "Git",
        "git": { "uri": git.url, "ref": git.ref_ },
    });
    if let Some(secret) = source_secret {
        source["sourceSecret"] = json!({ "name": secret });
    }

    let from = json!({ "kind": "DockerImage", "name": build.base_image });
    let strategy = match &build.dockerfile {
        Some(path) => json!({
            "type": "Docker",
            "dockerStrategy": { "from": from, "dockerfilePath": path },
        }),
        None => json!({
            "type": "Source",
            "sourceStrategy": { "from": from },
        }),
    };

    serde_json::from_value(json!({
        "apiVersion": ar.api_version,
        "kind": ar.kind,
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": job_labels(&job_name, "build"),
        },
        "spec": {
            "runPolicy": "Serial",
            "source": source,
            "strategy": strategy,
            "output": { "to": { "kind": "ImageStreamTag", "name": format!("{name}:latest") } },
        },
    }))
    .map_err(|e| Error::serialization_for_kind(&ar.kind, e.to_string()))
}

fn s2i_phase(phase: Option<&str>) -> BuildInfoPhase {
    match phase {
        Some("New") | Some("Pending") => BuildInfoPhase::Pending,
        Some("Running") => BuildInfoPhase::Running,
        Some("Complete") => BuildInfoPhase::Complete,
        Some("Failed") | Some("Error") => BuildInfoPhase::Failed,
        Some("Cancelled") => BuildInfoPhase::Cancelled,
        // A build the server has not yet stamped is about to start
        None => BuildInfoPhase::Pending,
        Some(_) => BuildInfoPhase::Unknown,
    }
}

/// Project an OpenShift Build onto [`BuildInfo`]
fn build_info(build: &DynamicObject) -> BuildInfo {
    let image_reference = str_at(build, "/status/outputDockerImageReference").map(|image| {
        match str_at(build, "/status/output/to/imageDigest") {
            Some(digest) => format!("{image}@{digest}"),
            None => image.to_string(),
        }
    });
    BuildInfo {
        name: build.name_any(),
        phase: s2i_phase(str_at(build, "/status/phase")),
        image_reference,
        message: str_at(build, "/status/message")
            .or_else(|| str_at(build, "/status/reason"))
            .map(str::to_string),
        start_time: time_at(build, "/status/startTimestamp"),
        completion_time: time_at(build, "/status/completionTimestamp"),
        created_at: created_at(build),
    }
}

#[async_trait]
impl BuildStrategy for S2iStrategy {
    fn name(&self) -> &'static str {
        S2I_STRATEGY
    }

    async fn detect(&self, namespace: &str) -> Result<bool, Error> {
        self.client
            .api_available(&kinds::build_config(), namespace)
            .await
    }

    fn validate_config(&self, job: &NotebookValidationJob) -> Result<(), Error> {
        let job_name = job.name_any();
        if job.spec.notebook.git.url.trim().is_empty() {
            return Err(Error::validation_for_field(
                job_name,
                "spec.notebook.git.url",
                "s2i builds need a git repository URL",
            ));
        }
        if let Some(build) = job.build_config() {
            build.timeout_duration().map_err(|e| {
                Error::validation_for_field(
                    &job_name,
                    "spec.podConfig.buildConfig.timeout",
                    e.to_string(),
                )
            })?;
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job = %job.name_any(), strategy = S2I_STRATEGY))]
    async fn create_build(&self, job: &NotebookValidationJob) -> Result<BuildInfo, Error> {
        let namespace = job_namespace(job)?;
        let job_name = job.name_any();
        let build = job.build_config().ok_or_else(|| {
            Error::validation_for_field(
                &job_name,
                "spec.podConfig.buildConfig.enabled",
                "build is not enabled",
            )
        })?;

        if let Some(existing) = self.get_latest_build(&namespace, &job_name).await? {
            debug!(build = %existing.name, "build already triggered");
            return Ok(existing);
        }

        let git = &job.spec.notebook.git;
        let source_secret = match &git.credentials_secret {
            Some(secret) => Some(
                ensure_backend_credential(
                    self.client.as_ref(),
                    &namespace,
                    secret,
                    BackendKind::S2i,
                    &git.url,
                )
                .await?,
            ),
            None => None,
        };

        self.ensure_image_stream(&namespace, &job_name).await?;
        self.ensure_build_config(&namespace, job, build, source_secret.as_deref())
            .await?;

        let bc_name = build_name(&job_name);
        let request = json!({
            "kind": "BuildRequest",
            "apiVersion": "build.openshift.io/v1",
            "metadata": { "name": bc_name },
        });
        let triggered = self
            .client
            .instantiate(&kinds::build_config(), &namespace, &bc_name, &request)
            .await?;
        let info = build_info(&triggered);
        info!(build = %info.name, namespace = %namespace, "triggered s2i build");
        Ok(info)
    }

    async fn get_latest_build(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Option<BuildInfo>, Error> {
        Ok(select_latest(self.list_builds(namespace, job_name).await?))
    }

    async fn get_build_status(
        &self,
        namespace: &str,
        build_name: &str,
    ) -> Result<BuildInfo, Error> {
        self.client
            .get_object(&kinds::build(), namespace, build_name)
            .await?
            .map(|b| build_info(&b))
            .ok_or_else(|| not_found("Build", build_name))
    }

    async fn cleanup_old_builds(
        &self,
        namespace: &str,
        job_name: &str,
        keep: usize,
    ) -> Result<(), Error> {
        for name in builds_to_prune(self.list_builds(namespace, job_name).await?, keep) {
            self.delete_build(namespace, &name).await?;
        }
        Ok(())
    }

    async fn delete_build(&self, namespace: &str, build_name: &str) -> Result<(), Error> {
        self.client
            .delete_object(&kinds::build(), namespace, build_name)
            .await?;
        info!(build = build_name, namespace, "deleted s2i build");
        Ok(())
    }
}
