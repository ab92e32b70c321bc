//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::job::SubmissionError;
use crate::core::types::TimeSlice;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The submission was rejected before anything was persisted.
    #[error("invalid submission: {0}")]
    InvalidSubmission(#[from] SubmissionError),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// The scheduler has shut down.
    #[error("scheduler is stopped")]
    Stopped,
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused.
    Paused,
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Active queue pointer observed at the start of the tick.
    pub active_queue: Option<TimeSlice>,
    /// Slices whose advance lock was taken and whose jobs were dispatched.
    pub dispatched: Vec<TimeSlice>,
    /// Slices left for another node or a later tick.
    pub deferred: Vec<TimeSlice>,
    /// Slices the active queue moved past during the tick.
    pub advanced: Vec<TimeSlice>,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Run one tick now.
    Tick {
        response: oneshot::Sender<Result<TickReport, SchedulerError>>,
    },
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
