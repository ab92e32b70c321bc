//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type that allows external control
//! of the scheduler through commands like tick, pause, resume, and shutdown,
//! plus direct access to job submission and inspection.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::clock::Clock;
use crate::core::executor::JobExecutor;
use crate::core::job::JobDetails;
use crate::core::retry::RetryPolicy;
use crate::core::trigger::Trigger;
use crate::core::types::{JobId, NodeId, TimeSlice};
use crate::events::EventBus;
use crate::storage::{SliceStatus, Storage, StorageError};

use super::engine::SchedulerCore;
use super::types::{SchedulerCommand, SchedulerError, SchedulerState, TickReport};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
pub struct SchedulerHandle<S: Storage> {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
    pub(crate) core: Arc<SchedulerCore<S>>,
}

impl<S: Storage> Clone for SchedulerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            state: Arc::clone(&self.state),
            core: Arc::clone(&self.core),
        }
    }
}

impl<S: Storage + 'static> SchedulerHandle<S> {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?;

        Ok(())
    }

    /// Run one tick now.
    ///
    /// Returns once due slices have been dispatched, not when their jobs
    /// have finished.
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        self.send_result_command(|response| SchedulerCommand::Tick { response }, "tick")
            .await
    }

    /// Pause the scheduler.
    ///
    /// While paused, no new slices are dispatched. In-flight jobs keep
    /// running and drained slices still advance.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the scheduler after being paused.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Shutdown the scheduler.
    ///
    /// Waits for in-flight slices up to the shutdown timeout, then releases
    /// every lock this node holds.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }

    /// Check if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == SchedulerState::Paused
    }

    /// Validate and persist a new job, returning it with its generated id.
    pub async fn schedule_job(
        &self,
        job_type: impl Into<String>,
        job_name: impl Into<String>,
        parameters: BTreeMap<String, String>,
        trigger: Trigger,
    ) -> Result<JobDetails, SchedulerError> {
        self.schedule(JobDetails::new(job_type, job_name, parameters, trigger))
            .await
    }

    /// Validate and persist a prepared job.
    ///
    /// Rejected with [`SchedulerError::Stopped`] once shutdown has begun.
    pub async fn schedule(&self, job: JobDetails) -> Result<JobDetails, SchedulerError> {
        if self.state().await == SchedulerState::Stopped {
            return Err(SchedulerError::Stopped);
        }
        self.core.submit(job).await
    }

    /// Register an executor for a job type.
    pub fn register(
        &self,
        job_type: impl Into<String>,
        executor: Arc<dyn JobExecutor>,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
    ) {
        self.core.registry.register(job_type, executor, retry_policy);
    }

    /// Registered job types.
    pub fn job_types(&self) -> Vec<String> {
        self.core.registry.job_types()
    }

    /// Earliest slice not yet fully processed.
    pub async fn active_queue(&self) -> Result<Option<TimeSlice>, StorageError> {
        self.core.active_queue().await
    }

    /// Index sets of a slice.
    pub async fn slice_status(&self, slice: TimeSlice) -> Result<SliceStatus, StorageError> {
        self.core.storage.get_slice_status(slice).await
    }

    /// Load a job.
    pub async fn get_job(&self, job_id: &JobId) -> Result<JobDetails, SchedulerError> {
        match self.core.storage.get_job(job_id).await {
            Ok(job) => Ok(job),
            Err(StorageError::NotFound(_)) => Err(SchedulerError::JobNotFound(job_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// All persisted jobs.
    pub async fn list_jobs(&self) -> Result<Vec<JobDetails>, StorageError> {
        self.core.storage.list_jobs().await
    }

    /// Current time according to the scheduler's clock.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.core.clock.now()
    }

    /// Width of a time slice.
    pub fn slice_width(&self) -> std::time::Duration {
        self.core.slice_width
    }

    /// The slice containing an instant, at this scheduler's width.
    pub fn slice_of(&self, instant: chrono::DateTime<chrono::Utc>) -> TimeSlice {
        TimeSlice::containing(instant, self.core.slice_width)
    }

    /// Identity this node uses as lock owner.
    pub fn node_id(&self) -> &NodeId {
        &self.core.node_id
    }

    /// Event bus the scheduler emits to.
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.core.event_bus)
    }

    /// Number of locks this node currently holds.
    pub fn held_locks(&self) -> usize {
        self.core.locks.held_count()
    }
}
