//! Retry policies for failed jobs.
//!
//! A policy maps a failed job and its error to either a retry delay or a
//! terminal verdict. The scheduler never caps retries on its own; bounding
//! them is the policy's job.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::executor::JobError;
use super::job::JobDetails;

/// Outcome of consulting a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-arm the job as a single execution this far in the future.
    RetryAfter(Duration),
    /// Mark the job permanently failed.
    Terminal,
}

/// Decides what happens to a job whose executor failed.
pub trait RetryPolicy: Send + Sync {
    /// Decide the fate of `job` after it failed with `error`.
    fn decide(&self, job: &JobDetails, error: &JobError) -> RetryDecision;
}

/// Never retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn decide(&self, _job: &JobDetails, _error: &JobError) -> RetryDecision {
        RetryDecision::Terminal
    }
}

/// Retry indefinitely after a fixed delay.
///
/// Suited to cleanup work that must eventually complete.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryPolicy for FixedDelay {
    fn decide(&self, job: &JobDetails, error: &JobError) -> RetryDecision {
        tracing::warn!(job_id = %job.job_id, job_type = %job.job_type, error = %error, "Execution of {} failed", job);
        tracing::info!(job_id = %job.job_id, "{} will be retried in {:?}", job, self.delay);
        RetryDecision::RetryAfter(self.delay)
    }
}

/// Conditions under which a job should be retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryCondition {
    /// Retry on any error.
    #[default]
    Always,

    /// Retry only on transient errors (timeouts, transient failures).
    TransientOnly,

    /// Never retry, regardless of max_attempts.
    Never,
}

/// Fixed-delay retries bounded by a maximum number of attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedRetry {
    /// Maximum number of retries, not including the initial attempt (0 = no retries).
    /// For example, `max_attempts = 3` allows up to 3 retries after the initial failure.
    pub max_attempts: u32,

    /// Fixed delay between attempts.
    #[serde(with = "serde_duration")]
    pub delay: Duration,

    /// Condition for when to retry.
    pub retry_on: RetryCondition,
}

impl BoundedRetry {
    /// Create a policy with fixed delay retries.
    ///
    /// # Arguments
    /// * `max_attempts` - Maximum retry attempts (not including initial try)
    /// * `delay` - Fixed delay between retries
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            retry_on: RetryCondition::Always,
        }
    }

    /// Builder: set the retry condition.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    /// Check if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0 && self.retry_on != RetryCondition::Never
    }

    /// Check if we should retry given the number of retries already made.
    pub fn should_retry(&self, retries: u32, error: &JobError) -> bool {
        match self.retry_on {
            RetryCondition::Never => false,
            RetryCondition::TransientOnly if !error.is_transient() => false,
            _ => retries < self.max_attempts,
        }
    }
}

impl RetryPolicy for BoundedRetry {
    fn decide(&self, job: &JobDetails, error: &JobError) -> RetryDecision {
        if self.should_retry(job.retry_count, error) {
            RetryDecision::RetryAfter(self.delay)
        } else {
            RetryDecision::Terminal
        }
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as seconds (matching YAML config format).
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
