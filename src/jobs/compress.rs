//! Datapoint compression job.
//!
//! A compression run covers one block of raw data: the full block that
//! ended at or before the target time. With a 2h block and a target of
//! 05:10 the block is `[02:00, 04:00)`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::executor::{JobError, JobExecutor};
use crate::core::job::JobDetails;
use crate::core::trigger::parse_duration;

use super::services::{ConfigurationService, MetricsService};

/// Job type of compression runs.
pub const JOB_NAME: &str = "COMPRESS_DATA";

/// Epoch millis the block is derived from. Defaults to the trigger time.
pub const TARGET_TIME: &str = "targetTime";

/// Block size as a duration expression, e.g. `2h`.
pub const BLOCK_SIZE: &str = "blockSize";

/// Configuration id and key consulted when no block size is given.
pub const CONFIG_ID: &str = "compression";
pub const CONFIG_BLOCK_SIZE_KEY: &str = "blockSize";

pub const DEFAULT_BLOCK_SIZE: Duration = Duration::from_secs(2 * 60 * 60);

/// Compresses the block preceding the target time.
pub struct CompressData {
    metrics: Arc<dyn MetricsService>,
    config: Arc<dyn ConfigurationService>,
}

impl CompressData {
    pub fn new(metrics: Arc<dyn MetricsService>, config: Arc<dyn ConfigurationService>) -> Self {
        Self { metrics, config }
    }

    async fn block_size(&self, job: &JobDetails) -> Result<Duration, JobError> {
        if let Some(value) = job.parameter(BLOCK_SIZE) {
            return parse_block_size(value);
        }
        match self.config.get(CONFIG_ID, CONFIG_BLOCK_SIZE_KEY).await {
            Ok(Some(value)) => parse_block_size(&value),
            Ok(None) => Ok(DEFAULT_BLOCK_SIZE),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read compression block size, using default");
                Ok(DEFAULT_BLOCK_SIZE)
            }
        }
    }
}

/// Parse a block size expression.
pub fn parse_block_size(value: &str) -> Result<Duration, JobError> {
    parse_duration(value).map_err(|e| JobError::InvalidParameter {
        name: BLOCK_SIZE.to_string(),
        reason: e.to_string(),
    })
}

/// Parse the `targetTime` parameter.
pub fn parse_target_time(value: &str) -> Result<DateTime<Utc>, JobError> {
    let invalid = |reason: &str| JobError::InvalidParameter {
        name: TARGET_TIME.to_string(),
        reason: reason.to_string(),
    };
    let millis: i64 = value
        .trim()
        .parse()
        .map_err(|_| invalid("expected epoch milliseconds"))?;
    DateTime::from_timestamp_millis(millis).ok_or_else(|| invalid("timestamp out of range"))
}

/// The block `[truncate(target) - block, truncate(target))`.
///
/// Returns `None` when the block size is zero or the bounds overflow.
pub fn block_bounds(
    target: DateTime<Utc>,
    block: Duration,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let block_ms = i64::try_from(block.as_millis()).ok()?;
    if block_ms == 0 {
        return None;
    }
    let end_ms = target.timestamp_millis().div_euclid(block_ms).checked_mul(block_ms)?;
    let start_ms = end_ms.checked_sub(block_ms)?;
    Some((
        DateTime::from_timestamp_millis(start_ms)?,
        DateTime::from_timestamp_millis(end_ms)?,
    ))
}

#[async_trait]
impl JobExecutor for CompressData {
    async fn execute(&self, job: &JobDetails) -> Result<(), JobError> {
        let target = match job.parameter(TARGET_TIME) {
            Some(value) => parse_target_time(value)?,
            None => job.trigger.trigger_time(),
        };
        let block = self.block_size(job).await?;
        let (start, end) = block_bounds(target, block).ok_or_else(|| JobError::InvalidParameter {
            name: BLOCK_SIZE.to_string(),
            reason: format!("no block of {:?} around {}", block, target),
        })?;

        tracing::info!(
            job_id = %job.job_id,
            start = %start,
            end = %end,
            "Compressing data block"
        );
        let started = std::time::Instant::now();
        self.metrics.compress_block(start, end).await?;
        tracing::info!(job_id = %job.job_id, duration = ?started.elapsed(), "Compression finished");
        Ok(())
    }

    fn validate_parameters(&self, job: &JobDetails) -> Result<(), JobError> {
        if let Some(value) = job.parameter(TARGET_TIME) {
            parse_target_time(value)?;
        }
        if let Some(value) = job.parameter(BLOCK_SIZE) {
            parse_block_size(value)?;
        }
        Ok(())
    }
}
