//! Notebook validation operator - builds and executes notebooks for NotebookValidationJob

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use notebook_build::resources::sweep_build_resources;
use notebook_build::{BuildSettings, KubeBuildClient};
use notebook_common::crd::NotebookValidationJob;
use notebook_common::duration::parse_duration;
use notebook_common::retry::{retry_with_backoff, RetryConfig, RetryPolicy};
use notebook_common::telemetry::{init_telemetry, TelemetryConfig};
use notebook_common::{Error, FIELD_MANAGER};
use notebook_controller::{error_policy, reconcile, Context, ReconcileConfig, RunnerSettings};

/// Watcher timeout (seconds); must stay below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Notebook validation operator
#[derive(Parser, Debug)]
#[command(name = "notebook-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log as human-readable text instead of JSON
    #[arg(long, env = "NOTEBOOK_LOG_TEXT", global = true)]
    log_text: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the CRD and reconcile NotebookValidationJobs (default mode)
    Controller(ControllerArgs),

    /// Delete the build workspace volumes left behind by a job
    Sweep {
        /// Namespace of the job
        #[arg(long)]
        namespace: String,
        /// Name of the job
        #[arg(long)]
        job: String,
    },
}

#[derive(Args, Debug, Default)]
struct ControllerArgs {
    #[command(flatten)]
    reconcile: ReconcileArgs,
    #[command(flatten)]
    build: BuildArgs,
    #[command(flatten)]
    runner: RunnerArgs,
}

#[derive(Args, Debug)]
struct ReconcileArgs {
    /// Counted retries before a job fails
    #[arg(long, env = "NOTEBOOK_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Requeue delays for retriable failures, by retry count
    #[arg(
        long,
        env = "NOTEBOOK_BACKOFF_SCHEDULE",
        value_delimiter = ',',
        default_value = "1m,2m,5m",
        value_parser = parse_duration
    )]
    backoff_schedule: Vec<Duration>,

    /// Requeue delay after a transient failure
    #[arg(long, env = "NOTEBOOK_TRANSIENT_DELAY", default_value = "60s", value_parser = parse_duration)]
    transient_delay: Duration,

    /// Requeue delay while a build runs
    #[arg(long, env = "NOTEBOOK_BUILD_POLL_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    build_poll_interval: Duration,

    /// Requeue delay after a build is triggered
    #[arg(long, env = "NOTEBOOK_BUILD_CREATE_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    build_create_interval: Duration,

    /// Requeue delay while a notebook executes
    #[arg(long, env = "NOTEBOOK_VALIDATION_POLL_INTERVAL", default_value = "15s", value_parser = parse_duration)]
    validation_poll_interval: Duration,
}

impl Default for ReconcileArgs {
    fn default() -> Self {
        let config = ReconcileConfig::default();
        Self {
            max_retries: config.retry.max_retries,
            backoff_schedule: config.retry.backoff_schedule,
            transient_delay: config.retry.transient_delay,
            build_poll_interval: config.build_poll_interval,
            build_create_interval: config.build_create_interval,
            validation_poll_interval: config.validation_poll_interval,
        }
    }
}

impl From<ReconcileArgs> for ReconcileConfig {
    fn from(args: ReconcileArgs) -> Self {
        Self {
            retry: RetryPolicy {
                max_retries: args.max_retries,
                backoff_schedule: args.backoff_schedule,
                transient_delay: args.transient_delay,
            },
            build_poll_interval: args.build_poll_interval,
            build_create_interval: args.build_create_interval,
            validation_poll_interval: args.validation_poll_interval,
        }
    }
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Namespace the pipeline tasks are copied from
    #[arg(long, env = "NOTEBOOK_TASK_SOURCE_NAMESPACE", default_value = notebook_build::settings::DEFAULT_TASK_SOURCE_NAMESPACE)]
    task_source_namespace: String,

    /// Version stamped on namespace task copies
    #[arg(long, env = "NOTEBOOK_TASK_VERSION", default_value = notebook_build::settings::DEFAULT_TASK_VERSION)]
    task_version: String,

    /// Service account pipeline runs execute as
    #[arg(long, env = "NOTEBOOK_BUILD_SERVICE_ACCOUNT", default_value = notebook_build::settings::DEFAULT_SERVICE_ACCOUNT)]
    build_service_account: String,

    /// SecurityContextConstraints granted to the build service account
    #[arg(long, env = "NOTEBOOK_SCC_NAME", default_value = notebook_build::settings::DEFAULT_SCC_NAME)]
    scc_name: String,

    /// Size of each build workspace volume
    #[arg(long, env = "NOTEBOOK_BUILD_VOLUME_SIZE", default_value = notebook_build::settings::DEFAULT_VOLUME_SIZE)]
    build_volume_size: String,

    /// Storage class for build workspace volumes
    #[arg(long, env = "NOTEBOOK_BUILD_STORAGE_CLASS")]
    build_storage_class: Option<String>,

    /// Registry builds push to unless the job names one
    #[arg(long, env = "NOTEBOOK_DEFAULT_REGISTRY", default_value = notebook_build::settings::DEFAULT_REGISTRY)]
    default_registry: String,
}

impl Default for BuildArgs {
    fn default() -> Self {
        let settings = BuildSettings::default();
        Self {
            task_source_namespace: settings.task_source_namespace,
            task_version: settings.task_version,
            build_service_account: settings.service_account,
            scc_name: settings.scc_name,
            build_volume_size: settings.volume_size,
            build_storage_class: settings.storage_class,
            default_registry: settings.default_registry,
        }
    }
}

impl From<BuildArgs> for BuildSettings {
    fn from(args: BuildArgs) -> Self {
        Self {
            task_source_namespace: args.task_source_namespace,
            task_version: args.task_version,
            service_account: args.build_service_account,
            scc_name: args.scc_name,
            volume_size: args.build_volume_size,
            storage_class: args.build_storage_class,
            default_registry: args.default_registry,
        }
    }
}

#[derive(Args, Debug)]
struct RunnerArgs {
    /// Image running the repository clone in validation pods
    #[arg(long, env = "NOTEBOOK_GIT_CLONE_IMAGE", default_value = notebook_controller::runner::DEFAULT_GIT_CLONE_IMAGE)]
    git_clone_image: String,
}

impl Default for RunnerArgs {
    fn default() -> Self {
        Self {
            git_clone_image: RunnerSettings::default().git_clone_image,
        }
    }
}

impl From<RunnerArgs> for RunnerSettings {
    fn from(args: RunnerArgs) -> Self {
        Self {
            git_clone_image: args.git_clone_image,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&NotebookValidationJob::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: !cli.log_text,
        filter: None,
    })?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
        Some(Commands::Sweep { namespace, job }) => sweep(&namespace, &job).await,
    }
}

/// Install the NotebookValidationJob CRD with server-side apply
///
/// Retried with backoff: the API server may still be settling when the
/// operator starts.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: &Api<CustomResourceDefinition> = &Api::all(client.clone());
    let params = &PatchParams::apply(FIELD_MANAGER).force();
    let crd = NotebookValidationJob::crd();
    let patch = &Patch::Apply(&crd);
    let name = NotebookValidationJob::crd_name();

    tracing::info!(crd = %name, "Installing NotebookValidationJob CRD...");
    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install CRD", || async move {
        crds.patch(name, params, patch).await.map_err(Error::from)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install NotebookValidationJob CRD: {}", e))?;
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let config = ReconcileConfig::from(args.reconcile);
    tracing::info!(
        max_retries = config.retry.max_retries,
        build_poll_secs = config.build_poll_interval.as_secs(),
        validation_poll_secs = config.validation_poll_interval.as_secs(),
        "Starting NotebookValidationJob controller"
    );

    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .build_settings(args.build.into())
            .runner_settings(args.runner.into())
            .build(),
    );
    let jobs: Api<NotebookValidationJob> = Api::all(client);

    Controller::new(jobs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok((job, action)) => {
                    tracing::debug!(job = %job.name, ?action, "reconciliation completed")
                }
                Err(e) => tracing::error!(error = ?e, "reconciliation error"),
            }
            std::future::ready(())
        })
        .await;

    tracing::info!("Controller shut down");
    Ok(())
}

async fn sweep(namespace: &str, job: &str) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let build_client = KubeBuildClient::new(client);

    let deleted = sweep_build_resources(&build_client, namespace, job).await?;
    tracing::info!(namespace, job, deleted, "Swept build volumes");
    Ok(())
}
