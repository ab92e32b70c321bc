//! Built-in maintenance jobs.
//!
//! - `DELETE_TENANT`: removes all data of a tenant, retried every five
//!   minutes until it succeeds
//! - `DELETE_METRIC`: removes a single metric
//! - `COMPRESS_DATA`: compresses one block of raw datapoints, either on
//!   demand or from a repeating job
//!
//! [`JobsService`] registers them on a scheduler and offers submission
//! helpers.

pub mod compress;
pub mod delete_metric;
pub mod delete_tenant;
mod service;
mod services;

pub use compress::CompressData;
pub use delete_metric::DeleteMetric;
pub use delete_tenant::DeleteTenant;
pub use service::{JobsService, SUBMISSION_DELAY};
pub use services::{ConfigurationService, MetricType, MetricsService};
