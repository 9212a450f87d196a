//! Phase handlers
//!
//! Each handler reads the job, makes bounded API calls and returns the
//! requeue action for its phase. Failures are returned unclassified; the
//! driver in [`crate::controller`] decides what they mean.

pub(crate) mod building;
pub(crate) mod initializing;
pub(crate) mod validating;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, warn};

use notebook_common::crd::{
    condition_types, set_condition, Condition, ConditionStatus, NotebookValidationJob,
    NotebookValidationJobStatus, ValidationPhase,
};
use notebook_common::events::actions;
use notebook_common::Error;

use crate::controller::Context;

/// Status to build the next write from
pub(crate) fn current_status(job: &NotebookValidationJob) -> NotebookValidationJobStatus {
    job.status.clone().unwrap_or_default()
}

/// Namespace of a job; cluster-scoped jobs do not exist
pub(crate) fn job_namespace(job: &NotebookValidationJob) -> Result<String, Error> {
    job.namespace().ok_or_else(|| {
        Error::validation_for_field(job.name_any(), "metadata.namespace", "job has no namespace")
    })
}

/// Persist `status` unless it equals what the job already carries.
///
/// Identical writes would produce no watch event but still cost a round
/// trip, and a rewritten timestamp would retrigger the watch.
pub(crate) async fn update_status_if_changed(
    job: &NotebookValidationJob,
    status: &NotebookValidationJobStatus,
    ctx: &Context,
) -> Result<(), Error> {
    if job.status.as_ref() == Some(status) {
        debug!(phase = %status.phase, "status unchanged, skipping update");
        return Ok(());
    }

    let namespace = job_namespace(job)?;
    let resource_version = job.resource_version().unwrap_or_default();
    ctx.kube
        .patch_status(&namespace, &job.name_any(), &resource_version, status)
        .await
}

/// Publish an event on the job
pub(crate) async fn publish(
    job: &NotebookValidationJob,
    ctx: &Context,
    type_: EventType,
    reason: &str,
    action: &str,
    note: impl Into<String>,
) {
    ctx.events
        .publish(&job.object_ref(&()), type_, reason, action, Some(note.into()))
        .await;
}

/// How a job failed
pub(crate) struct Failure<'a> {
    /// Condition set to False alongside Ready
    pub condition_type: &'a str,
    /// Condition reason
    pub reason: &'a str,
    /// User-facing message
    pub message: String,
    /// Reason on the published event
    pub event_reason: &'a str,
}

/// Condition describing the work of the phase a job failed in
pub(crate) fn condition_for_phase(phase: &ValidationPhase) -> &'static str {
    match phase {
        ValidationPhase::Building => condition_types::BUILD_COMPLETE,
        ValidationPhase::BuildComplete | ValidationPhase::ValidationRunning => {
            condition_types::VALIDATION_COMPLETE
        }
        _ => condition_types::READY,
    }
}

/// Move a job to Failed. The job is terminal afterwards.
pub(crate) async fn fail_job(
    job: &NotebookValidationJob,
    mut status: NotebookValidationJobStatus,
    failure: Failure<'_>,
    ctx: &Context,
) -> Result<Action, Error> {
    let failed_during = job.phase();
    warn!(
        phase = %failed_during,
        reason = failure.reason,
        message = %failure.message,
        "job failed"
    );

    status.phase = ValidationPhase::Failed;
    status.message = Some(failure.message.clone());
    status.completion_time.get_or_insert_with(Utc::now);
    set_condition(
        &mut status.conditions,
        Condition::new(
            failure.condition_type,
            ConditionStatus::False,
            failure.reason,
            failure.message.clone(),
        ),
    );
    if failure.condition_type != condition_types::READY {
        set_condition(
            &mut status.conditions,
            Condition::new(
                condition_types::READY,
                ConditionStatus::False,
                failure.reason,
                format!("failed during {failed_during}: {}", failure.message),
            ),
        );
    }
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::PROGRESSING,
            ConditionStatus::False,
            failure.reason,
            format!("failed during {failed_during}"),
        ),
    );

    update_status_if_changed(job, &status, ctx).await?;
    publish(
        job,
        ctx,
        EventType::Warning,
        failure.event_reason,
        actions::RECONCILE,
        failure.message,
    )
    .await;
    Ok(Action::await_change())
}
