//! Entry point for the built-in maintenance jobs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::core::executor::JobExecutor;
use crate::core::job::{JobDetails, SubmissionError};
use crate::core::retry::RetryPolicy;
use crate::core::trigger::Trigger;
use crate::core::types::TimeSlice;
use crate::scheduler::{JobRegistry, Scheduler, SchedulerError, SchedulerHandle};
use crate::storage::Storage;

use super::services::{ConfigurationService, MetricType, MetricsService};
use super::{compress, delete_metric, delete_tenant};
use super::{CompressData, DeleteMetric, DeleteTenant};

/// Delay applied to jobs submitted through the helpers.
pub const SUBMISSION_DELAY: Duration = Duration::from_secs(60);

/// Registers the built-in executors on a scheduler and submits their jobs.
pub struct JobsService<S: Storage> {
    scheduler: SchedulerHandle<S>,
    metrics: Arc<dyn MetricsService>,
    config: Arc<dyn ConfigurationService>,
    /// Block size of the recurring compression job, when enabled.
    compression: Option<Duration>,
}

impl<S: Storage + 'static> JobsService<S> {
    pub fn new(
        scheduler: SchedulerHandle<S>,
        metrics: Arc<dyn MetricsService>,
        config: Arc<dyn ConfigurationService>,
    ) -> Self {
        Self {
            scheduler,
            metrics,
            config,
            compression: None,
        }
    }

    /// Keep a repeating compression job with the given block size.
    pub fn with_compression(mut self, block_size: Duration) -> Self {
        self.compression = Some(block_size);
        self
    }

    /// The scheduler jobs are submitted to.
    pub fn scheduler(&self) -> &SchedulerHandle<S> {
        &self.scheduler
    }

    /// Register the built-in job types on a scheduler that has not started,
    /// then start it.
    ///
    /// No tick can reach a persisted built-in job before its executor is in
    /// the registry.
    pub async fn launch(
        scheduler: Scheduler<S>,
        metrics: Arc<dyn MetricsService>,
        config: Arc<dyn ConfigurationService>,
    ) -> (Self, JoinHandle<()>) {
        register_builtins(scheduler.registry(), &metrics, &config);
        let (handle, task) = scheduler.start().await;
        (Self::new(handle, metrics, config), task)
    }

    /// Register any missing built-in job types and, if enabled, the
    /// recurring compression job.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        register_builtins(&self.scheduler.core.registry, &self.metrics, &self.config);

        if let Some(block_size) = self.compression {
            self.ensure_compression_job(block_size).await?;
        }

        tracing::info!(job_types = ?self.scheduler.job_types(), "Jobs service started");
        Ok(())
    }

    /// Register an executor for a custom job type.
    pub fn register(
        &self,
        job_type: impl Into<String>,
        executor: Arc<dyn JobExecutor>,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
    ) {
        self.scheduler.register(job_type, executor, retry_policy);
    }

    /// Submit a job of any registered type.
    ///
    /// Built-in types get the same parameter checks as the `submit_*` helpers.
    pub async fn submit(
        &self,
        job_type: &str,
        job_name: impl Into<String>,
        parameters: BTreeMap<String, String>,
        trigger: Trigger,
    ) -> Result<JobDetails, SchedulerError> {
        self.scheduler
            .schedule_job(job_type, job_name, parameters, trigger)
            .await
    }

    /// Shut down the underlying scheduler.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.scheduler.shutdown().await
    }

    async fn ensure_compression_job(
        &self,
        block_size: Duration,
    ) -> Result<Option<JobDetails>, SchedulerError> {
        let existing = self.scheduler.list_jobs().await?;
        if let Some(job) = existing
            .iter()
            .find(|job| job.job_type == compress::JOB_NAME && job.trigger.is_repeating())
        {
            tracing::debug!(job_id = %job.job_id, "Compression job already scheduled");
            return Ok(None);
        }

        let width = self.scheduler.slice_width();
        let first_run = TimeSlice::ceil(self.scheduler.now(), block_size).start();
        let trigger = Trigger::repeating(first_run, block_size, width)
            .map_err(SubmissionError::from)?;
        let job = self
            .scheduler
            .schedule_job(
                compress::JOB_NAME,
                compress::JOB_NAME,
                BTreeMap::from([(
                    compress::BLOCK_SIZE.to_string(),
                    format!("{}s", block_size.as_secs()),
                )]),
                trigger,
            )
            .await?;
        tracing::info!(job_id = %job.job_id, block_size = ?block_size, "Scheduled recurring compression");
        Ok(Some(job))
    }

    fn one_minute_out(&self) -> Trigger {
        Trigger::single_after(
            self.scheduler.now(),
            SUBMISSION_DELAY,
            self.scheduler.slice_width(),
        )
    }

    /// Schedule deletion of a tenant's data.
    pub async fn submit_delete_tenant(&self, tenant_id: &str) -> Result<JobDetails, SchedulerError> {
        let tenant_id = required(delete_tenant::TENANT_ID, tenant_id)?;
        self.scheduler
            .schedule_job(
                delete_tenant::JOB_NAME,
                format!("{}_{}", delete_tenant::JOB_NAME, tenant_id),
                BTreeMap::from([(delete_tenant::TENANT_ID.to_string(), tenant_id.to_string())]),
                self.one_minute_out(),
            )
            .await
    }

    /// Schedule deletion of a single metric.
    pub async fn submit_delete_metric(
        &self,
        tenant_id: &str,
        metric_type: &str,
        metric_name: &str,
    ) -> Result<JobDetails, SchedulerError> {
        let tenant_id = required(delete_metric::TENANT_ID, tenant_id)?;
        let metric_name = required(delete_metric::METRIC_NAME, metric_name)?;
        let metric_type: MetricType =
            metric_type
                .parse()
                .map_err(|reason| SubmissionError::InvalidParameter {
                    name: delete_metric::METRIC_TYPE.to_string(),
                    reason,
                })?;

        self.scheduler
            .schedule_job(
                delete_metric::JOB_NAME,
                format!(
                    "{}_{}_{}_{}",
                    delete_metric::JOB_NAME,
                    tenant_id,
                    metric_type,
                    metric_name
                ),
                BTreeMap::from([
                    (delete_metric::TENANT_ID.to_string(), tenant_id.to_string()),
                    (delete_metric::METRIC_TYPE.to_string(), metric_type.to_string()),
                    (delete_metric::METRIC_NAME.to_string(), metric_name.to_string()),
                ]),
                self.one_minute_out(),
            )
            .await
    }

    /// Schedule a one-off compression of the block preceding `timestamp`.
    pub async fn submit_compress(
        &self,
        timestamp: i64,
        block_size: Option<&str>,
    ) -> Result<JobDetails, SchedulerError> {
        tracing::debug!(timestamp, block_size = ?block_size, "Scheduling manual compression");

        let target = timestamp.to_string();
        compress::parse_target_time(&target).map_err(|e| SubmissionError::InvalidParameter {
            name: compress::TARGET_TIME.to_string(),
            reason: e.to_string(),
        })?;

        let mut parameters = BTreeMap::from([(compress::TARGET_TIME.to_string(), target)]);
        if let Some(block_size) = block_size {
            compress::parse_block_size(block_size).map_err(|e| {
                SubmissionError::InvalidParameter {
                    name: compress::BLOCK_SIZE.to_string(),
                    reason: e.to_string(),
                }
            })?;
            parameters.insert(compress::BLOCK_SIZE.to_string(), block_size.trim().to_string());
        }

        self.scheduler
            .schedule_job(
                compress::JOB_NAME,
                format!("{}_single_{}", compress::JOB_NAME, timestamp),
                parameters,
                self.one_minute_out(),
            )
            .await
    }
}

fn register_builtins(
    registry: &JobRegistry,
    metrics: &Arc<dyn MetricsService>,
    config: &Arc<dyn ConfigurationService>,
) {
    if !registry.contains(delete_tenant::JOB_NAME) {
        registry.register(
            delete_tenant::JOB_NAME,
            Arc::new(DeleteTenant::new(Arc::clone(metrics))),
            Some(Arc::new(DeleteTenant::retry_policy())),
        );
    }
    if !registry.contains(delete_metric::JOB_NAME) {
        registry.register(
            delete_metric::JOB_NAME,
            Arc::new(DeleteMetric::new(Arc::clone(metrics))),
            None,
        );
    }
    if !registry.contains(compress::JOB_NAME) {
        registry.register(
            compress::JOB_NAME,
            Arc::new(CompressData::new(Arc::clone(metrics), Arc::clone(config))),
            None,
        );
    }
}

fn required<'a>(name: &'static str, value: &'a str) -> Result<&'a str, SubmissionError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SubmissionError::MissingField(name));
    }
    Ok(value)
}
