//! Tenant deletion job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::executor::{JobError, JobExecutor};
use crate::core::job::JobDetails;
use crate::core::retry::FixedDelay;

use super::services::MetricsService;

/// Job type of tenant deletions.
pub const JOB_NAME: &str = "DELETE_TENANT";

/// Parameter holding the tenant id.
pub const TENANT_ID: &str = "tenantId";

/// Delay between attempts. Deletion is retried until it succeeds.
pub const RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Deletes all data of the tenant named by the `tenantId` parameter.
pub struct DeleteTenant {
    metrics: Arc<dyn MetricsService>,
}

impl DeleteTenant {
    pub fn new(metrics: Arc<dyn MetricsService>) -> Self {
        Self { metrics }
    }

    /// Retry policy registered alongside the executor.
    pub fn retry_policy() -> FixedDelay {
        FixedDelay::new(RETRY_DELAY)
    }
}

#[async_trait]
impl JobExecutor for DeleteTenant {
    async fn execute(&self, job: &JobDetails) -> Result<(), JobError> {
        let tenant_id = job.require_parameter(TENANT_ID)?;
        tracing::info!(job_id = %job.job_id, tenant_id = %tenant_id, "Deleting tenant");
        self.metrics.delete_tenant(tenant_id).await?;
        tracing::info!(job_id = %job.job_id, tenant_id = %tenant_id, "Tenant deleted");
        Ok(())
    }

    fn validate_parameters(&self, job: &JobDetails) -> Result<(), JobError> {
        job.require_parameter(TENANT_ID).map(|_| ())
    }
}
