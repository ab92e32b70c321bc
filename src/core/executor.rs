//! Job executor trait and error types.
//!
//! The `JobExecutor` trait is the unit of work the scheduler dispatches.
//! Executors are registered per job type; every job of that type is run by
//! the same executor instance.

use async_trait::async_trait;
use thiserror::Error;

use super::job::JobDetails;

/// Boxed error used at collaborator boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by job logic.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// A required job parameter is missing or malformed.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Job timed out.
    #[error("job timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A transient error that may succeed on retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// The executor panicked.
    #[error("executor panicked: {0}")]
    Panicked(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] BoxError),
}

impl JobError {
    /// Check if this error is considered transient (should trigger retry).
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_) | JobError::Timeout(_))
    }

    /// Shorthand for a missing required parameter.
    pub fn missing_parameter(name: &str) -> Self {
        JobError::InvalidParameter {
            name: name.to_string(),
            reason: "missing".to_string(),
        }
    }
}

/// Job logic invoked by the scheduler for each due job of a registered type.
///
/// # Example
///
/// ```ignore
/// use slicer::{JobDetails, JobError, JobExecutor};
/// use async_trait::async_trait;
///
/// struct Purge;
///
/// #[async_trait]
/// impl JobExecutor for Purge {
///     async fn execute(&self, job: &JobDetails) -> Result<(), JobError> {
///         let tenant = job.require_parameter("tenantId")?;
///         // ... purge data for `tenant`
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run the job to completion.
    ///
    /// An `Err` is routed to the job type's retry policy; it never aborts the
    /// tick or sibling jobs.
    async fn execute(&self, job: &JobDetails) -> Result<(), JobError>;

    /// Check a job's parameters when it is submitted, before it is persisted.
    fn validate_parameters(&self, _job: &JobDetails) -> Result<(), JobError> {
        Ok(())
    }
}
