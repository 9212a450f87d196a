//! Initializing: pick the path through the state machine

use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use tracing::info;

use notebook_common::crd::{
    condition_types, reasons, Condition, ConditionStatus, NotebookValidationJob, ValidationPhase,
};
use notebook_common::Error;

use super::{current_status, update_status_if_changed};
use crate::controller::Context;

pub(crate) async fn reconcile(job: &NotebookValidationJob, ctx: &Context) -> Result<Action, Error> {
    // The timeout becomes the pod's active deadline; reject it before any work
    job.timeout_duration()?;

    let mut status = current_status(job);
    status.start_time.get_or_insert_with(Utc::now);
    status.observed_generation = job.metadata.generation;

    match job.build_config() {
        None => {
            let image = job.spec.pod_config.container_image.clone();
            info!(image = %image, "no build requested, validating with the configured image");
            status.effective_image = Some(image);
            status = status
                .phase(ValidationPhase::ValidationRunning)
                .message("validating with the configured image");
        }
        Some(build) => {
            info!(strategy = %build.strategy, "build requested");
            status = status
                .phase(ValidationPhase::Building)
                .message(format!("waiting for {} build", build.strategy))
                .condition(Condition::new(
                    condition_types::BUILD_STARTED,
                    ConditionStatus::Unknown,
                    reasons::BUILD_IN_PROGRESS,
                    format!("{} build requested", build.strategy),
                ));
        }
    }

    update_status_if_changed(job, &status, ctx).await?;
    Ok(Action::requeue(Duration::ZERO))
}
