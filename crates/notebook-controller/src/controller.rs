//! NotebookValidationJob controller
//!
//! [`reconcile`] dispatches on `status.phase` to one handler per phase. Any
//! error a handler returns is classified once here and turned into a requeue,
//! a counted retry or a failed job. Status is the only thing the driver
//! writes, always with the resourceVersion it read, so concurrent reconciles
//! of the same job resolve through 409 conflicts rather than locks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use tracing::{debug, error, instrument, warn};

#[cfg(test)]
use mockall::automock;

use notebook_build::{BuildSettings, KubeBuildClient, StrategyRegistry};
use notebook_common::crd::{
    condition_types, reasons, Condition, ConditionStatus, NotebookValidationJob,
    NotebookValidationJobStatus, ValidationPhase,
};
use notebook_common::events::{
    actions, reasons as event_reasons, EventPublisher, KubeEventPublisher,
};
use notebook_common::retry::RetryDecision;
use notebook_common::{classify, Error, ErrorClass, CONTROLLER_NAME, FIELD_MANAGER};

use crate::config::ReconcileConfig;
use crate::phases::{self, current_status, fail_job, publish, update_status_if_changed, Failure};
use crate::runner::{KubePodClient, NotebookRunner, PodNotebookRunner, RunnerSettings};

/// Requeue delay when a reconcile returns an error to the runtime
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Status writes for NotebookValidationJob
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Replace the job's status.
    ///
    /// A non-empty `resource_version` makes the write conditional: the API
    /// server rejects it with 409 Conflict if the job changed since it was
    /// read.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &NotebookValidationJobStatus,
    ) -> Result<(), Error>;
}

/// [`KubeClient`] backed by a kube `Client`
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &NotebookValidationJobStatus,
    ) -> Result<(), Error> {
        let api: Api<NotebookValidationJob> = Api::namespaced(self.client.clone(), namespace);

        let mut patch = serde_json::json!({ "status": status });
        if !resource_version.is_empty() {
            patch["metadata"] = serde_json::json!({ "resourceVersion": resource_version });
        }

        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch_status(name, &params, &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

/// Controller context shared by all reconciles
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .build_settings(settings)
///     .build();
/// ```
pub struct Context {
    /// Status writes (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Build backends by name
    pub strategies: StrategyRegistry,
    /// Executes notebooks
    pub runner: Arc<dyn NotebookRunner>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Timing and retry settings
    pub config: ReconcileConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context with default settings
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing with mock clients and default timing
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        strategies: StrategyRegistry,
        runner: Arc<dyn NotebookRunner>,
    ) -> Self {
        Self {
            kube,
            strategies,
            runner,
            events: Arc::new(notebook_common::events::NoopEventPublisher),
            config: ReconcileConfig::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    strategies: Option<StrategyRegistry>,
    runner: Option<Arc<dyn NotebookRunner>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: ReconcileConfig,
    build_settings: BuildSettings,
    runner_settings: RunnerSettings,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            strategies: None,
            runner: None,
            events: None,
            config: ReconcileConfig::default(),
            build_settings: BuildSettings::default(),
            runner_settings: RunnerSettings::default(),
        }
    }

    /// Override the status client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the build strategy registry
    pub fn strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = Some(strategies);
        self
    }

    /// Override the notebook runner
    pub fn runner(mut self, runner: Arc<dyn NotebookRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set timing and retry settings
    pub fn config(mut self, config: ReconcileConfig) -> Self {
        self.config = config;
        self
    }

    /// Settings for the default build backends
    pub fn build_settings(mut self, settings: BuildSettings) -> Self {
        self.build_settings = settings;
        self
    }

    /// Settings for the default notebook runner
    pub fn runner_settings(mut self, settings: RunnerSettings) -> Self {
        self.runner_settings = settings;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let build_settings = self.build_settings;
        let runner_settings = self.runner_settings;

        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(client.clone()))),
            strategies: self.strategies.unwrap_or_else(|| {
                StrategyRegistry::with_defaults(
                    Arc::new(KubeBuildClient::new(client.clone())),
                    build_settings,
                )
            }),
            runner: self.runner.unwrap_or_else(|| {
                Arc::new(PodNotebookRunner::new(
                    Arc::new(KubePodClient::new(client.clone())),
                    runner_settings,
                ))
            }),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME))),
            config: self.config,
        }
    }
}

/// Reconcile a NotebookValidationJob
///
/// Terminal jobs are left alone without touching any client. Everything else
/// runs the handler for the current phase; its failure is classified and
/// handled by [`handle_reconcile_error`].
#[instrument(
    skip(job, ctx),
    fields(job = %job.name_any(), namespace = ?job.namespace(), phase = %job.phase())
)]
pub async fn reconcile(job: Arc<NotebookValidationJob>, ctx: Arc<Context>) -> Result<Action, Error> {
    let phase = job.phase();
    if phase.is_terminal() {
        debug!("job is terminal, nothing to do");
        return Ok(Action::await_change());
    }
    debug!("reconciling job");

    let result = match phase {
        ValidationPhase::Initializing => phases::initializing::reconcile(&job, &ctx).await,
        ValidationPhase::Building => phases::building::reconcile(&job, &ctx).await,
        ValidationPhase::BuildComplete => phases::validating::promote(&job, &ctx).await,
        ValidationPhase::ValidationRunning => phases::validating::reconcile(&job, &ctx).await,
        ValidationPhase::Succeeded | ValidationPhase::Failed => Ok(Action::await_change()),
    };

    match result {
        Ok(action) => Ok(action),
        Err(e) => handle_reconcile_error(&job, &ctx, e).await,
    }
}

/// Turn a phase handler's failure into the job's next step.
///
/// - Transient: requeue after the transient delay; the retry count and phase
///   are untouched and a best-effort `Progressing` condition is written.
/// - Retriable: count the retry, then requeue on the backoff schedule or
///   fail with `RetryLimitExceeded` once the budget is spent.
/// - Terminal: fail with the classified reason.
///
/// Only a failure to persist a retriable or terminal outcome is returned.
pub async fn handle_reconcile_error(
    job: &NotebookValidationJob,
    ctx: &Context,
    err: Error,
) -> Result<Action, Error> {
    let classified = classify(&err);
    let policy = &ctx.config.retry;
    let phase = job.phase();

    match classified.class {
        ErrorClass::Transient => {
            warn!(
                error = %err,
                delay_secs = policy.transient_delay.as_secs(),
                "transient failure, requeueing"
            );
            let status = current_status(job).condition(Condition::new(
                condition_types::PROGRESSING,
                ConditionStatus::Unknown,
                reasons::TRANSIENT_ERROR,
                classified.message.clone(),
            ));
            if let Err(e) = update_status_if_changed(job, &status, ctx).await {
                debug!(error = %e, "could not record transient failure");
            }
            Ok(Action::requeue(policy.transient_delay))
        }
        ErrorClass::Retriable => {
            let mut status = current_status(job);
            status.retry_count += 1;
            status.last_retry_time = Some(Utc::now());

            match policy.decide(status.retry_count) {
                RetryDecision::Exhausted => {
                    let message = format!(
                        "gave up after {} retries: {}",
                        policy.max_retries, classified.message
                    );
                    fail_job(
                        job,
                        status,
                        Failure {
                            condition_type: phases::condition_for_phase(&phase),
                            reason: reasons::RETRY_LIMIT_EXCEEDED,
                            message,
                            event_reason: event_reasons::RETRY_LIMIT_EXCEEDED,
                        },
                        ctx,
                    )
                    .await
                }
                RetryDecision::Requeue(delay) => {
                    let retry_count = status.retry_count;
                    warn!(
                        error = %err,
                        retry_count,
                        delay_secs = delay.as_secs(),
                        "retriable failure, backing off"
                    );
                    status = status
                        .message(format!("retry {retry_count}: {}", classified.message))
                        .condition(Condition::new(
                            condition_types::PROGRESSING,
                            ConditionStatus::Unknown,
                            classified.reason,
                            classified.message.clone(),
                        ));
                    update_status_if_changed(job, &status, ctx).await?;
                    publish(
                        job,
                        ctx,
                        EventType::Warning,
                        classified.reason,
                        actions::RECONCILE,
                        format!(
                            "retry {retry_count} of {}: {}",
                            policy.max_retries, classified.message
                        ),
                    )
                    .await;
                    Ok(Action::requeue(delay))
                }
            }
        }
        ErrorClass::Terminal => {
            fail_job(
                job,
                current_status(job),
                Failure {
                    condition_type: phases::condition_for_phase(&phase),
                    reason: classified.reason,
                    message: classified.message.clone(),
                    event_reason: event_reasons::JOB_FAILED,
                },
                ctx,
            )
            .await
        }
    }
}

/// Error policy for the controller
///
/// Reached only when a reconcile could not persist its outcome; the job is
/// retried after [`ERROR_REQUEUE`].
pub fn error_policy(job: Arc<NotebookValidationJob>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        job = %job.name_any(),
        namespace = ?job.namespace(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;
    use notebook_build::{BuildInfo, BuildInfoPhase};
    use notebook_common::crd::{find_condition, BuildPhase, BuildStatus};

    use crate::runner::{MockNotebookRunner, RunOutcome};
    use crate::testing::{api_error, job, registry_with, MockStrategy, SPEC_IMAGE};

    /// Captured status updates, so tests assert on what was written
    /// rather than on how the mock was called.
    #[derive(Clone)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<NotebookValidationJobStatus>>>,
    }

    impl StatusCapture {
        fn new() -> Self {
            Self {
                updates: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn record(&self, status: NotebookValidationJobStatus) {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .push(status);
        }

        fn last(&self) -> NotebookValidationJobStatus {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
                .expect("status should have been written")
        }

        fn last_phase(&self) -> Option<ValidationPhase> {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .map(|s| s.phase.clone())
        }

        fn was_updated(&self) -> bool {
            !self
                .updates
                .lock()
                .expect("mutex should not be poisoned")
                .is_empty()
        }
    }

    fn capturing_kube() -> (Arc<dyn KubeClient>, StatusCapture) {
        let capture = StatusCapture::new();
        let capture_clone = capture.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_patch_status()
            .withf(|ns, name, rv, _| ns == "ds" && name == "churn" && rv == "7")
            .returning(move |_, _, _, status| {
                capture_clone.record(status.clone());
                Ok(())
            });
        (Arc::new(kube), capture)
    }

    fn idle_runner() -> Arc<dyn NotebookRunner> {
        let mut runner = MockNotebookRunner::new();
        runner.expect_run().never();
        Arc::new(runner)
    }

    fn runner_returning(outcome: RunOutcome) -> Arc<dyn NotebookRunner> {
        let mut runner = MockNotebookRunner::new();
        runner
            .expect_run()
            .returning(move |_, _| Ok(outcome.clone()));
        Arc::new(runner)
    }

    fn context(
        kube: Arc<dyn KubeClient>,
        strategies: StrategyRegistry,
        runner: Arc<dyn NotebookRunner>,
    ) -> Arc<Context> {
        Arc::new(Context::for_testing(kube, strategies, runner))
    }

    fn with_status(
        mut job: NotebookValidationJob,
        status: NotebookValidationJobStatus,
    ) -> Arc<NotebookValidationJob> {
        job.status = Some(status);
        Arc::new(job)
    }

    fn building(strategy: &str) -> NotebookValidationJob {
        let mut job = job(Some(strategy));
        job.status = Some(NotebookValidationJobStatus::with_phase(ValidationPhase::Building));
        job
    }

    fn strategy_reporting(latest: Option<BuildInfo>) -> MockStrategy {
        let mut strategy = MockStrategy::new();
        strategy.expect_name().return_const("tekton");
        strategy.expect_validate_config().returning(|_| Ok(()));
        strategy.expect_detect().returning(|_| Ok(true));
        strategy
            .expect_get_latest_build()
            .withf(|ns, job| ns == "ds" && job == "churn")
            .returning(move |_, _| Ok(latest.clone()));
        strategy
    }

    fn complete_build(image: Option<&str>) -> BuildInfo {
        let mut info = BuildInfo::new("churn-build", BuildInfoPhase::Complete);
        info.image_reference = image.map(str::to_string);
        info
    }

    // ==========================================================================
    // Story Tests: the happy paths through the state machine
    // ==========================================================================

    /// Story: a job without a build descriptor validates with the image it
    /// names, skipping the build phases entirely.
    #[tokio::test]
    async fn story_job_without_build_goes_straight_to_validation() {
        let (kube, capture) = capturing_kube();
        let ctx = context(kube, StrategyRegistry::new(), idle_runner());

        let action = reconcile(Arc::new(job(None)), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::ZERO));
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::ValidationRunning);
        assert_eq!(status.effective_image.as_deref(), Some(SPEC_IMAGE));
        assert!(status.start_time.is_some());
        assert_eq!(status.retry_count, 0);
    }

    /// Story: a job with a build descriptor enters Building with a
    /// BuildStarted condition.
    #[tokio::test]
    async fn story_job_with_build_enters_building() {
        let (kube, capture) = capturing_kube();
        let ctx = context(kube, StrategyRegistry::new(), idle_runner());

        let action = reconcile(Arc::new(job(Some("tekton"))), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::ZERO));
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Building);
        assert!(status.effective_image.is_none());
        assert!(find_condition(&status.conditions, condition_types::BUILD_STARTED).is_some());
    }

    /// Story: a zero timeout could never run, so the job fails on its
    /// first reconcile.
    #[tokio::test]
    async fn story_zero_timeout_is_rejected_up_front() {
        let (kube, capture) = capturing_kube();
        let ctx = context(kube, StrategyRegistry::new(), idle_runner());
        let mut instant = job(None);
        instant.spec.timeout = "0s".to_string();

        let action = reconcile(Arc::new(instant), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Failed);
        let ready = find_condition(&status.conditions, condition_types::READY).unwrap();
        assert_eq!(ready.reason, reasons::CONFIGURATION_ERROR);
        assert!(status.message.unwrap().contains("spec.timeout"));
    }

    /// Story: the first Building reconcile finds no build and triggers one.
    #[tokio::test]
    async fn story_missing_build_is_created() {
        let (kube, capture) = capturing_kube();
        let mut strategy = strategy_reporting(None);
        strategy
            .expect_create_build()
            .times(1)
            .returning(|_| Ok(BuildInfo::new("churn-build", BuildInfoPhase::Pending)));
        let ctx = context(kube, registry_with(strategy), idle_runner());

        let action = reconcile(Arc::new(building("tekton")), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Building);
        let build = status.build_status.unwrap();
        assert_eq!(build.build_name.as_deref(), Some("churn-build"));
        assert_eq!(build.strategy.as_deref(), Some("tekton"));
        assert_eq!(build.phase, BuildPhase::Pending);
        assert!(build.start_time.is_some());
    }

    /// Story: the cluster does not serve the strategy's APIs (Tekton is not
    /// installed). No build is attempted and the job fails without retries.
    #[tokio::test]
    async fn story_unavailable_strategy_fails_before_creating_a_build() {
        let (kube, capture) = capturing_kube();
        let mut strategy = MockStrategy::new();
        strategy.expect_name().return_const("tekton");
        strategy.expect_validate_config().returning(|_| Ok(()));
        strategy.expect_get_latest_build().returning(|_, _| Ok(None));
        strategy
            .expect_detect()
            .withf(|ns| ns == "ds")
            .returning(|_| Ok(false));
        strategy.expect_create_build().never();
        let ctx = context(kube, registry_with(strategy), idle_runner());

        let action = reconcile(Arc::new(building("tekton")), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Failed);
        assert_eq!(status.retry_count, 0);
        let message = status.message.unwrap();
        assert!(message.contains("Build strategy not available"), "{message}");
        assert!(message.contains("available: none"), "{message}");
        let condition = find_condition(&status.conditions, condition_types::BUILD_COMPLETE).unwrap();
        assert_eq!(condition.reason, reasons::BUILD_FAILED);
    }

    /// Story: a running build keeps the job in Building and polls again in
    /// 30 seconds.
    #[tokio::test]
    async fn story_running_build_is_polled() {
        let (kube, capture) = capturing_kube();
        let strategy =
            strategy_reporting(Some(BuildInfo::new("churn-build", BuildInfoPhase::Running)));
        let ctx = context(kube, registry_with(strategy), idle_runner());

        let action = reconcile(Arc::new(building("tekton")), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert_eq!(capture.last_phase(), Some(ValidationPhase::Building));
        assert_eq!(capture.last().build_status.unwrap().phase, BuildPhase::Running);
    }

    /// Story: polling a build that has not changed writes nothing.
    #[tokio::test]
    async fn story_unchanged_poll_does_not_rewrite_status() {
        let (kube, capture) = capturing_kube();
        let strategy =
            strategy_reporting(Some(BuildInfo::new("churn-build", BuildInfoPhase::Running)));
        let ctx = context(kube, registry_with(strategy), idle_runner());

        reconcile(Arc::new(building("tekton")), ctx.clone()).await.unwrap();
        let first = capture.last();
        let writes = capture.updates.lock().unwrap().len();

        let action = reconcile(with_status(job(Some("tekton")), first), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert_eq!(capture.updates.lock().unwrap().len(), writes);
    }

    /// Story: a completed build's image is adopted and the job moves to
    /// BuildComplete without delay; older builds are pruned.
    #[tokio::test]
    async fn story_complete_build_adopts_image() {
        let (kube, capture) = capturing_kube();
        let mut strategy = strategy_reporting(Some(complete_build(Some("img:v1"))));
        strategy
            .expect_cleanup_old_builds()
            .withf(|_, job, keep| job == "churn" && *keep == 3)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = context(kube, registry_with(strategy), idle_runner());

        let action = reconcile(Arc::new(building("tekton")), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::ZERO));
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::BuildComplete);
        assert_eq!(status.effective_image.as_deref(), Some("img:v1"));
        let build = status.build_status.unwrap();
        assert_eq!(build.image_reference.as_deref(), Some("img:v1"));
        assert!(build.completion_time.is_some());
    }

    /// Story: an image reference once recorded is never replaced.
    #[tokio::test]
    async fn story_recorded_image_is_immutable() {
        let (kube, capture) = capturing_kube();
        let mut strategy = strategy_reporting(Some(complete_build(Some("img:v2"))));
        strategy.expect_cleanup_old_builds().returning(|_, _, _| Ok(()));
        let ctx = context(kube, registry_with(strategy), idle_runner());

        let mut job = building("tekton");
        if let Some(status) = job.status.as_mut() {
            status.build_status = Some(BuildStatus {
                image_reference: Some("img:v1".to_string()),
                ..Default::default()
            });
        }
        reconcile(Arc::new(job), ctx).await.unwrap();

        assert_eq!(capture.last().effective_image.as_deref(), Some("img:v1"));
    }

    /// Story: a failed prune does not hold the job back.
    #[tokio::test]
    async fn story_prune_failure_is_ignored() {
        let (kube, capture) = capturing_kube();
        let mut strategy = strategy_reporting(Some(complete_build(Some("img:v1"))));
        strategy
            .expect_cleanup_old_builds()
            .returning(|_, _, _| Err(api_error(403, "Forbidden")));
        let ctx = context(kube, registry_with(strategy), idle_runner());

        let action = reconcile(Arc::new(building("tekton")), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::ZERO));
        assert_eq!(capture.last_phase(), Some(ValidationPhase::BuildComplete));
    }

    /// Story: BuildComplete always moves on to validation immediately.
    #[tokio::test]
    async fn story_build_complete_proceeds_to_validation() {
        let (kube, capture) = capturing_kube();
        let ctx = context(kube, StrategyRegistry::new(), idle_runner());
        let mut status = NotebookValidationJobStatus::with_phase(ValidationPhase::BuildComplete);
        status.effective_image = Some("img:v1".to_string());

        let action = reconcile(with_status(job(Some("tekton")), status), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::ZERO));
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::ValidationRunning);
        assert_eq!(status.effective_image.as_deref(), Some("img:v1"));
    }

    /// Story: a running notebook is polled every 15 seconds.
    #[tokio::test]
    async fn story_validation_in_progress_is_polled() {
        let (kube, capture) = capturing_kube();
        let ctx = context(
            kube,
            StrategyRegistry::new(),
            runner_returning(RunOutcome::InProgress),
        );
        let mut status = NotebookValidationJobStatus::with_phase(ValidationPhase::ValidationRunning);
        status.effective_image = Some(SPEC_IMAGE.to_string());

        let action = reconcile(with_status(job(None), status), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(15)));
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::ValidationRunning);
        assert_eq!(status.validation_pod_name.as_deref(), Some("churn-validation"));
    }

    /// Story: the runner is handed the image the build produced.
    #[tokio::test]
    async fn story_validation_runs_in_effective_image() {
        let (kube, capture) = capturing_kube();
        let mut runner = MockNotebookRunner::new();
        runner
            .expect_run()
            .withf(|_, image| image == "img:v1")
            .times(1)
            .returning(|_, _| {
                Ok(RunOutcome::Passed {
                    diagnostics: "12 cells executed".to_string(),
                })
            });
        let ctx = context(kube, StrategyRegistry::new(), Arc::new(runner));
        let mut status = NotebookValidationJobStatus::with_phase(ValidationPhase::ValidationRunning);
        status.effective_image = Some("img:v1".to_string());

        let action = reconcile(with_status(job(Some("tekton")), status), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Succeeded);
        assert!(status.completion_time.is_some());
        let ready = find_condition(&status.conditions, condition_types::READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
    }

    // ==========================================================================
    // Story Tests: failures
    // ==========================================================================

    /// Story: a failed notebook fails the job with the runner's reason and is
    /// never retried.
    #[tokio::test]
    async fn story_validation_failure_is_terminal() {
        let (kube, capture) = capturing_kube();
        let ctx = context(
            kube,
            StrategyRegistry::new(),
            runner_returning(RunOutcome::Failed {
                reason: "OOMKilled".to_string(),
                diagnostics: "validator exited with code 137".to_string(),
            }),
        );
        let status = NotebookValidationJobStatus::with_phase(ValidationPhase::ValidationRunning);

        let action = reconcile(with_status(job(None), status), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Failed);
        assert_eq!(status.retry_count, 0);
        let condition =
            find_condition(&status.conditions, condition_types::VALIDATION_COMPLETE).unwrap();
        assert_eq!(condition.reason, "OOMKilled");
        assert_eq!(condition.status, ConditionStatus::False);
    }

    /// Story: a failed build fails the job with the backend's own message.
    #[tokio::test]
    async fn story_failed_build_carries_backend_message() {
        let (kube, capture) = capturing_kube();
        let mut info = BuildInfo::new("churn-build", BuildInfoPhase::Failed);
        info.message = Some("step-build-image exited with code 125".to_string());
        let ctx = context(kube, registry_with(strategy_reporting(Some(info))), idle_runner());

        let action = reconcile(Arc::new(building("tekton")), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Failed);
        assert_eq!(
            status.message.as_deref(),
            Some("step-build-image exited with code 125")
        );
        let condition = find_condition(&status.conditions, condition_types::BUILD_COMPLETE).unwrap();
        assert_eq!(condition.reason, reasons::BUILD_FAILED);
        let ready = find_condition(&status.conditions, condition_types::READY).unwrap();
        assert!(ready.message.starts_with("failed during Building"));
    }

    /// Story: a build running past its timeout fails the job.
    #[tokio::test]
    async fn story_build_timeout_fails_job() {
        let (kube, capture) = capturing_kube();
        let strategy =
            strategy_reporting(Some(BuildInfo::new("churn-build", BuildInfoPhase::Running)));
        let ctx = context(kube, registry_with(strategy), idle_runner());

        let mut job = building("tekton");
        if let Some(status) = job.status.as_mut() {
            status.build_status = Some(BuildStatus {
                phase: BuildPhase::Running,
                start_time: Some(Utc::now() - ChronoDuration::hours(2)),
                ..Default::default()
            });
        }
        let action = reconcile(Arc::new(job), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Failed);
        let condition = find_condition(&status.conditions, condition_types::BUILD_COMPLETE).unwrap();
        assert_eq!(condition.reason, reasons::BUILD_TIMEOUT);
    }

    /// Story: naming a strategy nobody registered is a configuration error,
    /// not something a retry can fix.
    #[tokio::test]
    async fn story_unknown_strategy_is_terminal() {
        let (kube, capture) = capturing_kube();
        let ctx = context(
            kube,
            registry_with(strategy_reporting(None)),
            idle_runner(),
        );

        let action = reconcile(Arc::new(building("kaniko")), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Failed);
        assert_eq!(status.retry_count, 0);
        let condition = find_condition(&status.conditions, condition_types::BUILD_COMPLETE).unwrap();
        assert_eq!(condition.reason, reasons::CONFIGURATION_ERROR);
        assert!(status.message.unwrap().contains("kaniko"));
    }

    /// Story: a build that completes without an image is counted as a retry.
    #[tokio::test]
    async fn story_complete_build_without_image_is_retried() {
        let (kube, capture) = capturing_kube();
        let ctx = context(
            kube,
            registry_with(strategy_reporting(Some(complete_build(None)))),
            idle_runner(),
        );

        let action = reconcile(Arc::new(building("tekton")), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Building);
        assert_eq!(status.retry_count, 1);
        assert!(status.last_retry_time.is_some());
    }

    /// Story: retriable failures back off along the schedule.
    #[tokio::test]
    async fn story_retries_follow_backoff_schedule() {
        let (kube, capture) = capturing_kube();
        let mut strategy = MockStrategy::new();
        strategy.expect_name().return_const("tekton");
        strategy.expect_validate_config().returning(|_| Ok(()));
        strategy
            .expect_get_latest_build()
            .returning(|_, _| Err(Error::internal("pipeline run listing returned garbage")));
        let ctx = context(kube, registry_with(strategy), idle_runner());

        let mut job = building("tekton");
        if let Some(status) = job.status.as_mut() {
            status.retry_count = 2;
        }
        let action = reconcile(Arc::new(job), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        assert_eq!(capture.last().retry_count, 3);
        assert_eq!(capture.last_phase(), Some(ValidationPhase::Building));
    }

    /// Story: once the retry count exceeds the budget the job fails with a
    /// distinct reason.
    #[tokio::test]
    async fn story_retry_budget_exhausted() {
        let (kube, capture) = capturing_kube();
        let mut strategy = MockStrategy::new();
        strategy.expect_name().return_const("tekton");
        strategy.expect_validate_config().returning(|_| Ok(()));
        strategy
            .expect_get_latest_build()
            .returning(|_, _| Err(Error::build("tekton", "registry push failed")));
        let ctx = context(kube, registry_with(strategy), idle_runner());

        let mut job = building("tekton");
        if let Some(status) = job.status.as_mut() {
            status.retry_count = 3;
        }
        let action = reconcile(Arc::new(job), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::Failed);
        assert_eq!(status.retry_count, 4);
        let condition = find_condition(&status.conditions, condition_types::BUILD_COMPLETE).unwrap();
        assert_eq!(condition.reason, reasons::RETRY_LIMIT_EXCEEDED);
        assert!(status.message.unwrap().contains("registry push failed"));
    }

    /// Story: three reconciles in a row lose the status race. Each one
    /// requeues without counting a retry, and the fourth goes through.
    #[tokio::test]
    async fn story_conflicts_do_not_count_as_retries() {
        let capture = StatusCapture::new();
        let capture_clone = capture.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut kube = MockKubeClient::new();
        kube.expect_patch_status().returning(move |_, _, _, status| {
            // Handler write and best-effort Progressing write both conflict
            if calls_clone.fetch_add(1, Ordering::SeqCst) < 6 {
                return Err(api_error(409, "Conflict"));
            }
            capture_clone.record(status.clone());
            Ok(())
        });
        let ctx = context(Arc::new(kube), StrategyRegistry::new(), idle_runner());
        let job = Arc::new(job(None));

        for _ in 0..3 {
            let action = reconcile(job.clone(), ctx.clone()).await.unwrap();
            assert_eq!(action, Action::requeue(Duration::from_secs(60)));
            assert!(!capture.was_updated());
        }

        let action = reconcile(job, ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::ZERO));
        let status = capture.last();
        assert_eq!(status.phase, ValidationPhase::ValidationRunning);
        assert_eq!(status.retry_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    /// Story: a terminal outcome that cannot be persisted goes back to the
    /// runtime, which requeues through the error policy.
    #[tokio::test]
    async fn story_unpersisted_failure_is_returned() {
        let mut kube = MockKubeClient::new();
        kube.expect_patch_status()
            .returning(|_, _, _, _| Err(api_error(403, "Forbidden")));
        let ctx = context(
            Arc::new(kube),
            registry_with(strategy_reporting(None)),
            idle_runner(),
        );

        let err = reconcile(Arc::new(building("kaniko")), ctx.clone())
            .await
            .unwrap_err();
        assert!(err.is_forbidden());

        let action = error_policy(Arc::new(building("kaniko")), &err, ctx);
        assert_eq!(action, Action::requeue(ERROR_REQUEUE));
    }

    /// Story: finished jobs are never touched again.
    #[tokio::test]
    async fn story_terminal_phases_make_no_calls() {
        for phase in [ValidationPhase::Succeeded, ValidationPhase::Failed] {
            let mut kube = MockKubeClient::new();
            kube.expect_patch_status().never();
            let mut strategy = MockStrategy::new();
            strategy.expect_name().return_const("tekton");
            strategy.expect_get_latest_build().never();
            strategy.expect_create_build().never();
            let ctx = context(Arc::new(kube), registry_with(strategy), idle_runner());

            let status = NotebookValidationJobStatus::with_phase(phase);
            let action = reconcile(with_status(job(Some("tekton")), status), ctx)
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());
        }
    }
}
