//! Lifecycle events and event handling.
//!
//! This module provides event emission for job and time-slice lifecycle
//! events, enabling observability into scheduling decisions. Submission is
//! fire-and-forget, so events are the only way to watch a job's outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{JobId, TimeSlice};

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum Event {
    /// A job was handed to its executor.
    JobStarted {
        job_id: JobId,
        job_type: String,
        time_slice: TimeSlice,
        timestamp: Instant,
    },

    /// A job's executor returned successfully.
    JobCompleted {
        job_id: JobId,
        job_type: String,
        time_slice: TimeSlice,
        duration: Duration,
        timestamp: Instant,
    },

    /// A job's executor failed.
    ///
    /// `retry_at` is the new trigger time when the retry policy asked for
    /// another attempt, `None` when the failure is terminal.
    JobFailed {
        job_id: JobId,
        job_type: String,
        time_slice: TimeSlice,
        error: String,
        retry_at: Option<DateTime<Utc>>,
        timestamp: Instant,
    },

    /// A job was re-indexed under a later slice, either to retry it or for
    /// its next recurrence.
    JobRescheduled {
        job_id: JobId,
        from: TimeSlice,
        to: TimeSlice,
        retry_count: u32,
        timestamp: Instant,
    },

    /// A job was marked finished without running because its type has no
    /// registered executor.
    JobDeadLettered {
        job_id: JobId,
        job_type: String,
        time_slice: TimeSlice,
        timestamp: Instant,
    },

    /// Another node holds the advance lock for a slice; this node deferred it.
    TickDeferred {
        time_slice: TimeSlice,
        timestamp: Instant,
    },

    /// A slice was fully processed and the active queue moved past it.
    TimeSliceFinished {
        time_slice: TimeSlice,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobStarted { timestamp, .. } => *timestamp,
            Event::JobCompleted { timestamp, .. } => *timestamp,
            Event::JobFailed { timestamp, .. } => *timestamp,
            Event::JobRescheduled { timestamp, .. } => *timestamp,
            Event::JobDeadLettered { timestamp, .. } => *timestamp,
            Event::TickDeferred { timestamp, .. } => *timestamp,
            Event::TimeSliceFinished { timestamp, .. } => *timestamp,
        }
    }

    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Event::JobStarted { job_id, .. }
            | Event::JobCompleted { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::JobRescheduled { job_id, .. }
            | Event::JobDeadLettered { job_id, .. } => Some(*job_id),
            Event::TickDeferred { .. } | Event::TimeSliceFinished { .. } => None,
        }
    }

    /// Create a JobStarted event.
    pub fn job_started(job_id: JobId, job_type: impl Into<String>, time_slice: TimeSlice) -> Self {
        Event::JobStarted {
            job_id,
            job_type: job_type.into(),
            time_slice,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobCompleted event.
    pub fn job_completed(
        job_id: JobId,
        job_type: impl Into<String>,
        time_slice: TimeSlice,
        duration: Duration,
    ) -> Self {
        Event::JobCompleted {
            job_id,
            job_type: job_type.into(),
            time_slice,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobFailed event.
    pub fn job_failed(
        job_id: JobId,
        job_type: impl Into<String>,
        time_slice: TimeSlice,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> Self {
        Event::JobFailed {
            job_id,
            job_type: job_type.into(),
            time_slice,
            error,
            retry_at,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobRescheduled event.
    pub fn job_rescheduled(job_id: JobId, from: TimeSlice, to: TimeSlice, retry_count: u32) -> Self {
        Event::JobRescheduled {
            job_id,
            from,
            to,
            retry_count,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobDeadLettered event.
    pub fn job_dead_lettered(
        job_id: JobId,
        job_type: impl Into<String>,
        time_slice: TimeSlice,
    ) -> Self {
        Event::JobDeadLettered {
            job_id,
            job_type: job_type.into(),
            time_slice,
            timestamp: Instant::now(),
        }
    }

    /// Create a TickDeferred event.
    pub fn tick_deferred(time_slice: TimeSlice) -> Self {
        Event::TickDeferred {
            time_slice,
            timestamp: Instant::now(),
        }
    }

    /// Create a TimeSliceFinished event.
    pub fn time_slice_finished(time_slice: TimeSlice) -> Self {
        Event::TimeSliceFinished {
            time_slice,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
