//! BuildComplete and ValidationRunning: execute the notebook

use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info};

use notebook_common::crd::{
    condition_types, reasons, validation_pod_name, Condition, ConditionStatus,
    NotebookValidationJob, ValidationPhase,
};
use notebook_common::events::{actions, reasons as event_reasons};
use notebook_common::Error;

use super::{current_status, fail_job, publish, update_status_if_changed, Failure};
use crate::controller::Context;
use crate::runner::RunOutcome;

/// BuildComplete always proceeds straight to validation
pub(crate) async fn promote(job: &NotebookValidationJob, ctx: &Context) -> Result<Action, Error> {
    let status = current_status(job)
        .phase(ValidationPhase::ValidationRunning)
        .message("starting validation with the built image");
    update_status_if_changed(job, &status, ctx).await?;
    Ok(Action::requeue(Duration::ZERO))
}

pub(crate) async fn reconcile(job: &NotebookValidationJob, ctx: &Context) -> Result<Action, Error> {
    let mut status = current_status(job);
    let image = match (&status.effective_image, job.build_config()) {
        (Some(image), _) => image.clone(),
        (None, None) => job.spec.pod_config.container_image.clone(),
        (None, Some(_)) => {
            return Err(Error::internal_with_context(
                "validation",
                "build finished but no image was recorded",
            ))
        }
    };

    match ctx.runner.run(job, &image).await? {
        RunOutcome::InProgress => {
            let pod = validation_pod_name(&job.name_any());
            let first_poll = status.validation_pod_name.is_none();
            debug!(pod = %pod, "validation in progress");

            status.validation_pod_name = Some(pod.clone());
            status = status.message(format!("validating in pod {pod}")).condition(
                Condition::new(
                    condition_types::PROGRESSING,
                    ConditionStatus::True,
                    reasons::VALIDATION_RUNNING,
                    format!("notebook running in {image}"),
                ),
            );
            update_status_if_changed(job, &status, ctx).await?;

            if first_poll {
                publish(
                    job,
                    ctx,
                    EventType::Normal,
                    event_reasons::VALIDATION_STARTED,
                    actions::VALIDATE,
                    format!("started validation pod {pod}"),
                )
                .await;
            }
            Ok(Action::requeue(ctx.config.validation_poll_interval))
        }
        RunOutcome::Passed { diagnostics } => {
            info!(image = %image, "notebook validated");
            status.completion_time = Some(Utc::now());
            status = status
                .phase(ValidationPhase::Succeeded)
                .message(diagnostics.clone())
                .condition(Condition::new(
                    condition_types::VALIDATION_COMPLETE,
                    ConditionStatus::True,
                    reasons::VALIDATION_SUCCEEDED,
                    diagnostics.clone(),
                ))
                .condition(Condition::new(
                    condition_types::READY,
                    ConditionStatus::True,
                    reasons::VALIDATION_SUCCEEDED,
                    "notebook validated",
                ))
                .condition(Condition::new(
                    condition_types::PROGRESSING,
                    ConditionStatus::False,
                    reasons::VALIDATION_SUCCEEDED,
                    "validation finished",
                ));
            update_status_if_changed(job, &status, ctx).await?;
            publish(
                job,
                ctx,
                EventType::Normal,
                event_reasons::VALIDATION_SUCCEEDED,
                actions::VALIDATE,
                diagnostics,
            )
            .await;
            Ok(Action::await_change())
        }
        RunOutcome::Failed {
            reason,
            diagnostics,
        } => {
            fail_job(
                job,
                status,
                Failure {
                    condition_type: condition_types::VALIDATION_COMPLETE,
                    reason: &reason,
                    message: diagnostics,
                    event_reason: event_reasons::VALIDATION_FAILED,
                },
                ctx,
            )
            .await
        }
    }
}
