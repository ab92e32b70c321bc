//! Single metric deletion job.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::executor::{JobError, JobExecutor};
use crate::core::job::JobDetails;

use super::services::{MetricType, MetricsService};

/// Job type of metric deletions.
pub const JOB_NAME: &str = "DELETE_METRIC";

pub const TENANT_ID: &str = "tenantId";
pub const METRIC_TYPE: &str = "metricType";
pub const METRIC_NAME: &str = "metricName";

/// Deletes one metric's datapoints and index entry. Failures are terminal.
pub struct DeleteMetric {
    metrics: Arc<dyn MetricsService>,
}

impl DeleteMetric {
    pub fn new(metrics: Arc<dyn MetricsService>) -> Self {
        Self { metrics }
    }
}

/// Parse the `metricType` parameter.
pub fn parse_metric_type(value: &str) -> Result<MetricType, JobError> {
    value
        .parse()
        .map_err(|reason| JobError::InvalidParameter {
            name: METRIC_TYPE.to_string(),
            reason,
        })
}

#[async_trait]
impl JobExecutor for DeleteMetric {
    async fn execute(&self, job: &JobDetails) -> Result<(), JobError> {
        let tenant_id = job.require_parameter(TENANT_ID)?;
        let metric_type = parse_metric_type(job.require_parameter(METRIC_TYPE)?)?;
        let metric_name = job.require_parameter(METRIC_NAME)?;

        tracing::debug!(
            job_id = %job.job_id,
            tenant_id = %tenant_id,
            metric_type = %metric_type,
            metric_name = %metric_name,
            "Deleting metric"
        );
        self.metrics
            .delete_metric(tenant_id, metric_type, metric_name)
            .await?;
        Ok(())
    }

    fn validate_parameters(&self, job: &JobDetails) -> Result<(), JobError> {
        job.require_parameter(TENANT_ID)?;
        parse_metric_type(job.require_parameter(METRIC_TYPE)?)?;
        job.require_parameter(METRIC_NAME)?;
        Ok(())
    }
}
