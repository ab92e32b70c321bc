//! slicer - distributed, time-sliced background job scheduler.
//!
//! Jobs are indexed under the fixed-width time slice of their trigger time.
//! Every node walks due slices from a shared active queue pointer, takes a
//! per-slice advance lock, runs the slice's jobs and moves the pointer on
//! once every job in the slice has finished.

pub mod core;
pub mod events;
pub mod jobs;
pub mod lock;
pub mod scheduler;
pub mod storage;

pub mod config;
pub mod testing;

#[cfg(feature = "api")]
pub mod api;

pub use config::{ConfigError, SchedulerConfig, StorageConfig, YamlLoader};
pub use core::clock::{Clock, ManualClock, SystemClock};
pub use core::executor::{BoxError, JobError, JobExecutor};
pub use core::job::{JobDetails, SubmissionError};
pub use core::retry::{
    BoundedRetry, FixedDelay, NoRetry, RetryCondition, RetryDecision, RetryPolicy,
};
pub use core::trigger::{Trigger, TriggerError};
pub use core::types::{DEFAULT_SLICE_WIDTH, JobId, NodeId, TimeSlice};
pub use events::{Event, EventBus, EventHandler};
pub use jobs::{ConfigurationService, JobsService, MetricType, MetricsService};
pub use lock::{LockManager, LockOutcome};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle, SchedulerState, TickReport};
pub use storage::{
    Consistency, InMemoryStorage, SliceStatus, Storage, StorageError, StoredLock,
};

#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
