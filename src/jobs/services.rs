//! Collaborators the built-in jobs delegate to.
//!
//! The scheduler does not own metric data. Built-in jobs call out to a
//! `MetricsService` for the actual deletion or compression work and to a
//! `ConfigurationService` for runtime settings.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::executor::BoxError;

/// Kind of metric addressed by a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Gauge,
    Counter,
    Availability,
    String,
}

impl MetricType {
    /// Text code used in job parameters.
    pub fn code(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
            MetricType::Availability => "availability",
            MetricType::String => "string",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricType::Gauge),
            "counter" => Ok(MetricType::Counter),
            "availability" => Ok(MetricType::Availability),
            "string" => Ok(MetricType::String),
            other => Err(format!(
                "unknown metric type '{}', expected gauge, counter, availability or string",
                other
            )),
        }
    }
}

/// Data operations performed by the built-in jobs.
#[async_trait]
pub trait MetricsService: Send + Sync {
    /// Remove every metric and datapoint of a tenant.
    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), BoxError>;

    /// Remove one metric's data and its index entry.
    async fn delete_metric(
        &self,
        tenant_id: &str,
        metric_type: MetricType,
        metric_name: &str,
    ) -> Result<(), BoxError>;

    /// Compress raw datapoints in `[start, end)`.
    async fn compress_block(&self, start: DateTime<Utc>, end: DateTime<Utc>)
    -> Result<(), BoxError>;
}

/// Key/value runtime configuration, grouped by configuration id.
#[async_trait]
pub trait ConfigurationService: Send + Sync {
    /// Look up `key` under `config_id`.
    async fn get(&self, config_id: &str, key: &str) -> Result<Option<String>, BoxError>;
}
