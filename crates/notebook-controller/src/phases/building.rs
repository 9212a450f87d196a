//! Building: trigger the image build and follow it to an image

use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use notebook_build::{BuildInfo, BuildInfoPhase, BuildStrategy};
use notebook_common::crd::{
    condition_types, reasons, BuildPhase, BuildStatus, Condition, ConditionStatus,
    NotebookValidationJob, NotebookValidationJobStatus, ValidationPhase,
};
use notebook_common::events::{actions, reasons as event_reasons};
use notebook_common::Error;

use super::{current_status, fail_job, job_namespace, publish, update_status_if_changed, Failure};
use crate::controller::Context;

/// Builds kept per job when pruning after a successful build
pub(crate) const KEEP_BUILDS: usize = 3;

const STRATEGY_FIELD: &str = "spec.podConfig.buildConfig.strategy";

pub(crate) async fn reconcile(job: &NotebookValidationJob, ctx: &Context) -> Result<Action, Error> {
    let name = job.name_any();
    let namespace = job_namespace(job)?;
    let build = job.build_config().ok_or_else(|| {
        Error::validation_for_field(
            &name,
            "spec.podConfig.buildConfig",
            "build descriptor was removed or disabled while building",
        )
    })?;

    let strategy = ctx.strategies.get(&build.strategy).ok_or_else(|| {
        Error::validation_for_field(
            &name,
            STRATEGY_FIELD,
            format!(
                "unknown build strategy {:?} (available: {})",
                build.strategy,
                ctx.strategies.names().join(", ")
            ),
        )
    })?;
    strategy.validate_config(job)?;

    let status = current_status(job);
    let Some(latest) = strategy.get_latest_build(&namespace, &name).await? else {
        ensure_available(strategy.as_ref(), &namespace, ctx).await?;
        return start_build(job, strategy.as_ref(), status, ctx).await;
    };

    match latest.phase {
        BuildInfoPhase::Complete => adopt_image(job, strategy.as_ref(), status, latest, ctx).await,
        BuildInfoPhase::Failed | BuildInfoPhase::Cancelled => {
            let message = latest
                .message
                .clone()
                .unwrap_or_else(|| format!("build {} {}", latest.name, latest.phase));
            let mut status = status;
            status.build_status = Some(project(&latest, strategy.name(), status.build_status.as_ref()));
            fail_job(
                job,
                status,
                Failure {
                    condition_type: condition_types::BUILD_COMPLETE,
                    reason: reasons::BUILD_FAILED,
                    message,
                    event_reason: event_reasons::BUILD_FAILED,
                },
                ctx,
            )
            .await
        }
        BuildInfoPhase::Pending | BuildInfoPhase::Running | BuildInfoPhase::Unknown => {
            let timeout = build.timeout_duration()?;
            poll_build(job, strategy.as_ref(), status, latest, timeout, ctx).await
        }
    }
}

/// Project a backend build onto the job's build status.
///
/// The recorded start time and image reference win over the backend's:
/// the start time anchors the build timeout and the image is immutable once
/// recorded.
fn project(info: &BuildInfo, strategy: &str, existing: Option<&BuildStatus>) -> BuildStatus {
    let phase = match info.phase {
        BuildInfoPhase::Pending | BuildInfoPhase::Unknown => BuildPhase::Pending,
        BuildInfoPhase::Running => BuildPhase::Running,
        BuildInfoPhase::Complete => BuildPhase::Complete,
        BuildInfoPhase::Failed | BuildInfoPhase::Cancelled => BuildPhase::Failed,
    };
    BuildStatus {
        phase,
        build_name: Some(info.name.clone()),
        strategy: Some(strategy.to_string()),
        image_reference: existing
            .and_then(|b| b.image_reference.clone())
            .or_else(|| info.image_reference.clone()),
        start_time: existing
            .and_then(|b| b.start_time)
            .or(info.start_time)
            .or_else(|| Some(Utc::now())),
        completion_time: existing.and_then(|b| b.completion_time).or(info.completion_time),
        message: info.message.clone(),
    }
}

/// A strategy whose APIs the cluster does not serve can never build
async fn ensure_available(
    strategy: &dyn BuildStrategy,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    if strategy.detect(namespace).await? {
        return Ok(());
    }
    let available = ctx.strategies.detect_available(namespace).await;
    let available = if available.is_empty() {
        "none".to_string()
    } else {
        available.join(", ")
    };
    Err(Error::build_permanent(
        strategy.name(),
        format!(
            "Build strategy not available: {} APIs are not served in namespace {namespace} \
             (available: {available})",
            strategy.name()
        ),
    ))
}

async fn start_build(
    job: &NotebookValidationJob,
    strategy: &dyn BuildStrategy,
    mut status: NotebookValidationJobStatus,
    ctx: &Context,
) -> Result<Action, Error> {
    let created = strategy.create_build(job).await?;
    info!(strategy = strategy.name(), build = %created.name, "build created");

    status.build_status = Some(BuildStatus {
        start_time: Some(Utc::now()),
        ..project(&created, strategy.name(), None)
    });
    status = status
        .message(format!("build {} created", created.name))
        .condition(Condition::new(
            condition_types::BUILD_STARTED,
            ConditionStatus::True,
            reasons::BUILD_CREATED,
            format!("{} build {} created", strategy.name(), created.name),
        ));

    update_status_if_changed(job, &status, ctx).await?;
    publish(
        job,
        ctx,
        EventType::Normal,
        event_reasons::BUILD_STARTED,
        actions::BUILD,
        format!("created {} build {}", strategy.name(), created.name),
    )
    .await;
    Ok(Action::requeue(ctx.config.build_create_interval))
}

async fn adopt_image(
    job: &NotebookValidationJob,
    strategy: &dyn BuildStrategy,
    mut status: NotebookValidationJobStatus,
    latest: BuildInfo,
    ctx: &Context,
) -> Result<Action, Error> {
    let mut build_status = project(&latest, strategy.name(), status.build_status.as_ref());
    let image = build_status.image_reference.clone().ok_or_else(|| {
        Error::build(
            strategy.name(),
            format!("build {} completed without an image reference", latest.name),
        )
    })?;
    build_status.completion_time.get_or_insert_with(Utc::now);
    info!(build = %latest.name, image = %image, "build complete, adopting image");

    status.build_status = Some(build_status);
    status.effective_image = Some(image.clone());
    status = status
        .phase(ValidationPhase::BuildComplete)
        .message(format!("built image {image}"))
        .condition(Condition::new(
            condition_types::BUILD_COMPLETE,
            ConditionStatus::True,
            reasons::BUILD_SUCCEEDED,
            format!("build {} produced {image}", latest.name),
        ))
        .condition(Condition::new(
            condition_types::PROGRESSING,
            ConditionStatus::True,
            reasons::IMAGE_ADOPTED,
            format!("validating with {image}"),
        ));

    update_status_if_changed(job, &status, ctx).await?;
    publish(
        job,
        ctx,
        EventType::Normal,
        event_reasons::BUILD_SUCCEEDED,
        actions::BUILD,
        format!("build {} produced {image}", latest.name),
    )
    .await;

    let namespace = job_namespace(job)?;
    if let Err(e) = strategy
        .cleanup_old_builds(&namespace, &job.name_any(), KEEP_BUILDS)
        .await
    {
        warn!(error = %e, "failed to prune old builds");
    }

    Ok(Action::requeue(Duration::ZERO))
}

async fn poll_build(
    job: &NotebookValidationJob,
    strategy: &dyn BuildStrategy,
    mut status: NotebookValidationJobStatus,
    latest: BuildInfo,
    timeout: Duration,
    ctx: &Context,
) -> Result<Action, Error> {
    let build_status = project(&latest, strategy.name(), status.build_status.as_ref());
    let elapsed = build_status
        .start_time
        .and_then(|start| (Utc::now() - start).to_std().ok())
        .unwrap_or_default();

    if elapsed > timeout {
        let message = format!(
            "build {} did not finish within {}s",
            latest.name,
            timeout.as_secs()
        );
        status.build_status = Some(build_status);
        return fail_job(
            job,
            status,
            Failure {
                condition_type: condition_types::BUILD_COMPLETE,
                reason: reasons::BUILD_TIMEOUT,
                message,
                event_reason: event_reasons::BUILD_FAILED,
            },
            ctx,
        )
        .await;
    }

    debug!(build = %latest.name, phase = %latest.phase, "build in progress");
    status.build_status = Some(build_status);
    status = status
        .message(format!("build {} is {}", latest.name, latest.phase))
        .condition(Condition::new(
            condition_types::BUILD_STARTED,
            ConditionStatus::True,
            reasons::BUILD_IN_PROGRESS,
            format!("{} build {} is {}", strategy.name(), latest.name, latest.phase),
        ));

    update_status_if_changed(job, &status, ctx).await?;
    Ok(Action::requeue(ctx.config.build_poll_interval))
}
