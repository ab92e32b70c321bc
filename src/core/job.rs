//! Job details: the persisted unit of work.
//!
//! A `JobDetails` row is owned by the job table; time-slice index entries
//! refer to it by `JobId` only.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::executor::JobError;
use super::trigger::{Trigger, TriggerError};
use super::types::{JobId, TimeSlice};

/// Reasons a submission is rejected before anything is persisted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmissionError {
    /// A required field is empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// No executor is registered for the job type.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// A required parameter is missing or malformed.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// The trigger is malformed.
    #[error("invalid trigger: {0}")]
    InvalidTrigger(#[from] TriggerError),

    /// The trigger falls in a slice the cluster has already processed.
    #[error("trigger slice {trigger_slice} precedes active time slice {active_slice}")]
    SliceAlreadyProcessed {
        trigger_slice: TimeSlice,
        active_slice: TimeSlice,
    },

    /// A job with the same type and name is already scheduled in the slice.
    #[error("job '{job_name}' of type '{job_type}' is already scheduled for {time_slice}")]
    DuplicateJobName {
        job_type: String,
        job_name: String,
        time_slice: TimeSlice,
    },

    /// The executor of the job type refused the job.
    #[error("rejected by executor: {0}")]
    Rejected(String),
}

impl From<JobError> for SubmissionError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::InvalidParameter { name, reason } => {
                SubmissionError::InvalidParameter { name, reason }
            }
            other => SubmissionError::Rejected(other.to_string()),
        }
    }
}

/// A scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetails {
    /// Unique job identifier.
    pub job_id: JobId,
    /// Key into the executor registry.
    pub job_type: String,
    /// Human-readable name, unique within type and slice.
    pub job_name: String,
    /// Executor parameters.
    pub parameters: BTreeMap<String, String>,
    /// When the job is due and how it recurs.
    pub trigger: Trigger,
    /// Number of failed executions that led to a retry.
    pub retry_count: u32,
}

impl JobDetails {
    /// Create a new job with a generated id.
    pub fn new(
        job_type: impl Into<String>,
        job_name: impl Into<String>,
        parameters: BTreeMap<String, String>,
        trigger: Trigger,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            job_type: job_type.into(),
            job_name: job_name.into(),
            parameters,
            trigger,
            retry_count: 0,
        }
    }

    /// Builder: use a specific job id.
    pub fn with_id(mut self, job_id: JobId) -> Self {
        self.job_id = job_id;
        self
    }

    /// Builder: add a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Get a parameter value.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Get a non-blank parameter value or fail the execution.
    pub fn require_parameter(&self, key: &str) -> Result<&str, JobError> {
        match self.parameter(key) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(JobError::missing_parameter(key)),
        }
    }

    /// The slice this job is indexed under.
    pub fn time_slice(&self, width: Duration) -> TimeSlice {
        self.trigger.time_slice(width)
    }

    /// Copy of this job re-armed with `trigger`.
    pub fn rescheduled(&self, trigger: Trigger, retry_count: u32) -> Self {
        Self {
            trigger,
            retry_count,
            ..self.clone()
        }
    }

    /// Validate the fields that do not depend on cluster state.
    pub fn validate(&self, width: Duration) -> Result<(), SubmissionError> {
        if self.job_type.trim().is_empty() {
            return Err(SubmissionError::MissingField("job_type"));
        }
        if self.job_name.trim().is_empty() {
            return Err(SubmissionError::MissingField("job_name"));
        }
        if let Some(key) = self.parameters.keys().find(|k| k.trim().is_empty()) {
            return Err(SubmissionError::InvalidParameter {
                name: key.clone(),
                reason: "parameter names must not be blank".to_string(),
            });
        }
        self.trigger.validate(width)?;
        Ok(())
    }
}

impl fmt::Display for JobDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JobDetails[id={}, type={}, name={}, trigger={}, retries={}]",
            self.job_id,
            self.job_type,
            self.job_name,
            self.trigger.trigger_time(),
            self.retry_count
        )
    }
}
