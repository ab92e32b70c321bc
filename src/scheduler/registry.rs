//! Executor registry keyed by job type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::executor::JobExecutor;
use crate::core::retry::{NoRetry, RetryPolicy};

/// Executor and retry policy registered for one job type.
#[derive(Clone)]
pub struct JobRegistration {
    pub executor: Arc<dyn JobExecutor>,
    pub retry_policy: Arc<dyn RetryPolicy>,
}

/// Maps job types to their executors.
///
/// Registration may happen before or after the scheduler starts; a job
/// whose type is missing at dispatch time is dead-lettered.
#[derive(Default)]
pub struct JobRegistry {
    entries: RwLock<HashMap<String, JobRegistration>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `job_type`, replacing any previous entry.
    ///
    /// Without a policy, failures are terminal.
    pub fn register(
        &self,
        job_type: impl Into<String>,
        executor: Arc<dyn JobExecutor>,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
    ) {
        let job_type = job_type.into();
        let registration = JobRegistration {
            executor,
            retry_policy: retry_policy.unwrap_or_else(|| Arc::new(NoRetry)),
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.insert(job_type.clone(), registration).is_some() {
            tracing::info!(job_type = %job_type, "Replaced executor registration");
        } else {
            tracing::debug!(job_type = %job_type, "Registered executor");
        }
    }

    /// Look up the registration for `job_type`.
    pub fn get(&self, job_type: &str) -> Option<JobRegistration> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(job_type).cloned()
    }

    /// Whether `job_type` has an executor.
    pub fn contains(&self, job_type: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<_> = entries.keys().cloned().collect();
        types.sort();
        types
    }
}
