//! slicer - distributed, time-sliced job scheduler node.
//!
//! Usage:
//!   slicer run [--config slicer.yaml]       Run a scheduler node
//!   slicer validate --config slicer.yaml    Validate a configuration file
//!   slicer submit <job> [--config ...]      Submit a maintenance job
//!   slicer status [--config ...]            Show the active queue and jobs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use slicer::{
    BoxError, Event, EventBus, EventHandler, InMemoryStorage, JobsService, MetricType,
    MetricsService, Scheduler, SchedulerConfig, Storage, StorageConfig, YamlLoader,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// slicer - distributed, time-sliced job scheduler
#[derive(Parser)]
#[command(name = "slicer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the node configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scheduler node until Ctrl+C
    Run,

    /// Validate the configuration without running
    Validate,

    /// Submit a maintenance job, due one minute from now
    Submit {
        #[command(subcommand)]
        job: SubmitCommand,
    },

    /// Show the active queue pointer and persisted jobs
    Status,
}

#[derive(Subcommand)]
enum SubmitCommand {
    /// Delete all data of a tenant
    DeleteTenant {
        #[arg(value_name = "TENANT_ID")]
        tenant_id: String,
    },

    /// Delete a single metric
    DeleteMetric {
        #[arg(value_name = "TENANT_ID")]
        tenant_id: String,
        /// gauge, counter, availability or string
        #[arg(value_name = "TYPE")]
        metric_type: String,
        #[arg(value_name = "NAME")]
        metric_name: String,
    },

    /// Compress the block preceding a timestamp
    Compress {
        /// Epoch milliseconds
        #[arg(value_name = "TIMESTAMP")]
        timestamp: i64,

        /// Block size, e.g. 2h
        #[arg(long)]
        block_size: Option<String>,
    },
}

/// Event handler that logs job outcomes.
struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobCompleted {
                job_id,
                job_type,
                duration,
                ..
            } => {
                info!("Job {} ({}) completed in {:?}", job_id, job_type, duration);
            }
            Event::JobFailed {
                job_id,
                job_type,
                error,
                retry_at,
                ..
            } => match retry_at {
                Some(at) => warn!("Job {} ({}) failed: {}, retrying at {}", job_id, job_type, error, at),
                None => error!("Job {} ({}) failed: {}", job_id, job_type, error),
            },
            Event::JobDeadLettered { job_id, job_type, .. } => {
                warn!("Job {} has no executor for type '{}'", job_id, job_type);
            }
            Event::TimeSliceFinished { time_slice, .. } => {
                info!("Time slice {} finished", time_slice);
            }
            _ => {}
        }
    }
}

/// Metrics backend used when the node runs standalone: logs the work it
/// would hand to the data layer.
struct LoggingMetricsService;

#[async_trait]
impl MetricsService for LoggingMetricsService {
    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), BoxError> {
        info!(tenant_id = %tenant_id, "delete tenant");
        Ok(())
    }

    async fn delete_metric(
        &self,
        tenant_id: &str,
        metric_type: MetricType,
        metric_name: &str,
    ) -> Result<(), BoxError> {
        info!(tenant_id = %tenant_id, metric_type = %metric_type, metric_name = %metric_name, "delete metric");
        Ok(())
    }

    async fn compress_block(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), BoxError> {
        info!(start = %start, end = %end, "compress block");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => YamlLoader::load_config(path)?,
        None => SchedulerConfig::default(),
    };

    if let Commands::Validate = cli.command {
        return validate(&cli, &config);
    }

    match &config.storage {
        StorageConfig::Memory => {
            let storage = InMemoryStorage::new().with_consistency(config.consistency);
            dispatch(cli.command, &config, storage).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { .. } => match config.open_sqlite().await? {
            Some(storage) => dispatch(cli.command, &config, storage).await,
            None => Err("sqlite storage selected but not opened".into()),
        },
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => Err("built without sqlite support".into()),
    }
}

fn validate(cli: &Cli, config: &SchedulerConfig) -> Result<(), Box<dyn std::error::Error>> {
    match &cli.config {
        Some(path) => info!("Configuration {} is valid", path.display()),
        None => info!("No configuration given, defaults are valid"),
    }
    info!(
        "  slice width: {:?}, tick interval: {:?}, storage: {:?}",
        config.slice_width(),
        config.tick_interval(),
        config.storage
    );
    Ok(())
}

async fn dispatch<S: Storage + 'static>(
    command: Commands,
    config: &SchedulerConfig,
    storage: S,
) -> Result<(), Box<dyn std::error::Error>> {
    if matches!(config.storage, StorageConfig::Memory) && !matches!(command, Commands::Run) {
        warn!("In-memory storage is not shared; this command only sees its own process");
    }
    match command {
        Commands::Run => run_node(config, storage).await,
        Commands::Submit { job } => submit(config, storage, job).await,
        Commands::Status => status(config, storage).await,
        Commands::Validate => Ok(()),
    }
}

/// Start the jobs service on top of a scheduler built from `config`.
async fn start_service<S: Storage + 'static>(
    config: &SchedulerConfig,
    storage: S,
    manual_ticks: bool,
) -> Result<(Arc<JobsService<S>>, tokio::task::JoinHandle<()>), Box<dyn std::error::Error>> {
    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let mut scheduler = config.configure(Scheduler::new(storage).with_event_bus(event_bus));
    if manual_ticks {
        scheduler = scheduler.with_manual_ticks();
    }
    let (mut service, task) = JobsService::launch(
        scheduler,
        Arc::new(LoggingMetricsService),
        YamlLoader::configuration_service(config),
    )
    .await;
    if !manual_ticks {
        if let Some(block_size) = config.compression_block_size()? {
            service = service.with_compression(block_size);
        }
    }
    service.start().await?;
    Ok((Arc::new(service), task))
}

async fn run_node<S: Storage + 'static>(
    config: &SchedulerConfig,
    storage: S,
) -> Result<(), Box<dyn std::error::Error>> {
    let (service, scheduler_task) = start_service(config, storage, false).await?;
    info!(
        "Node {} running (slice width: {:?})",
        service.scheduler().node_id(),
        config.slice_width()
    );

    #[cfg(feature = "api")]
    let api_task = if config.api.enabled {
        let state = slicer::api::create_api_state(Arc::clone(&service));
        Some(slicer::api::start_server(config.api.socket_addr()?, state).await?)
    } else {
        None
    };

    info!("Press Ctrl+C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            service.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    #[cfg(feature = "api")]
    if let Some(task) = api_task {
        task.abort();
    }

    info!("Goodbye!");
    Ok(())
}

async fn submit<S: Storage + 'static>(
    config: &SchedulerConfig,
    storage: S,
    job: SubmitCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    let (service, _task) = start_service(config, storage, true).await?;

    let result = match job {
        SubmitCommand::DeleteTenant { tenant_id } => service.submit_delete_tenant(&tenant_id).await,
        SubmitCommand::DeleteMetric {
            tenant_id,
            metric_type,
            metric_name,
        } => {
            service
                .submit_delete_metric(&tenant_id, &metric_type, &metric_name)
                .await
        }
        SubmitCommand::Compress {
            timestamp,
            block_size,
        } => service.submit_compress(timestamp, block_size.as_deref()).await,
    };
    service.shutdown().await?;

    let job = result?;
    println!("Scheduled {} ({}) at {}", job.job_name, job.job_id, job.trigger.trigger_time());
    Ok(())
}

async fn status<S: Storage + 'static>(
    config: &SchedulerConfig,
    storage: S,
) -> Result<(), Box<dyn std::error::Error>> {
    let (service, _task) = start_service(config, storage, true).await?;
    let handle = service.scheduler();

    match handle.active_queue().await? {
        Some(pointer) => println!("Active queue: {}", pointer),
        None => println!("Active queue: not initialised"),
    }
    println!("Current slice: {}", handle.slice_of(handle.now()));

    let jobs = handle.list_jobs().await?;
    println!("Jobs: {}", jobs.len());
    for job in &jobs {
        println!(
            "  {} {} ({}) due {} retries {}",
            job.job_id,
            job.job_name,
            job.job_type,
            job.trigger.trigger_time(),
            job.retry_count
        );
    }

    service.shutdown().await?;
    Ok(())
}
