//! API response types.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::job::JobDetails;
use crate::core::trigger::Trigger;
use crate::core::types::TimeSlice;
use crate::scheduler::SchedulerState;
use crate::storage::SliceStatus;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Scheduler state response.
#[derive(Debug, Serialize)]
pub struct SchedulerStateResponse {
    pub state: SchedulerState,
    pub is_running: bool,
    pub is_paused: bool,
    pub node_id: String,
}

impl SchedulerStateResponse {
    pub fn new(state: SchedulerState, node_id: impl Into<String>) -> Self {
        Self {
            state,
            is_running: state == SchedulerState::Running,
            is_paused: state == SchedulerState::Paused,
            node_id: node_id.into(),
        }
    }
}

/// Active queue pointer response.
#[derive(Debug, Serialize)]
pub struct ActiveQueueResponse {
    /// Earliest slice not yet fully processed.
    pub active_queue: Option<TimeSlice>,
    pub active_queue_ms: Option<i64>,
    /// Slice containing the current instant.
    pub current_slice: TimeSlice,
    /// Due slices between the pointer and the current slice.
    pub lag: i64,
}

impl ActiveQueueResponse {
    pub fn new(active_queue: Option<TimeSlice>, current_slice: TimeSlice, width: Duration) -> Self {
        let width_ms = (width.as_millis() as i64).max(1);
        let lag = active_queue
            .map(|p| (current_slice.timestamp_millis() - p.timestamp_millis()) / width_ms)
            .unwrap_or(0)
            .max(0);
        Self {
            active_queue,
            active_queue_ms: active_queue.map(|p| p.timestamp_millis()),
            current_slice,
            lag,
        }
    }
}

/// Index sets of one slice.
#[derive(Debug, Serialize)]
pub struct SliceStatusResponse {
    pub time_slice: TimeSlice,
    pub time_slice_ms: i64,
    pub scheduled: Vec<String>,
    pub active: Vec<String>,
    pub finished: Vec<String>,
    /// Scheduled jobs not yet finished.
    pub pending: usize,
}

impl From<SliceStatus> for SliceStatusResponse {
    fn from(status: SliceStatus) -> Self {
        let ids = |set: &std::collections::BTreeSet<crate::core::types::JobId>| {
            set.iter().map(|id| id.to_string()).collect::<Vec<_>>()
        };
        Self {
            time_slice: status.time_slice,
            time_slice_ms: status.time_slice.timestamp_millis(),
            scheduled: ids(&status.scheduled),
            active: ids(&status.active),
            finished: ids(&status.finished),
            pending: status.pending().len(),
        }
    }
}

/// A persisted job.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
    pub job_type: String,
    pub job_name: String,
    pub parameters: BTreeMap<String, String>,
    pub trigger: Trigger,
    pub time_slice: TimeSlice,
    pub retry_count: u32,
}

impl JobResponse {
    pub fn new(job: JobDetails, width: Duration) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            time_slice: job.time_slice(width),
            job_type: job.job_type,
            job_name: job.job_name,
            parameters: job.parameters,
            trigger: job.trigger,
            retry_count: job.retry_count,
        }
    }
}

/// List of jobs response.
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub count: usize,
}

/// Simple message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
