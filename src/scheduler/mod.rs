//! Time-sliced scheduler engine.
//!
//! This module provides the clock-driven loop that walks due time slices,
//! dispatches their jobs and advances the cluster-wide active queue.

mod engine;
mod handle;
mod registry;
mod types;

pub use engine::{Scheduler, advance_lock_name};
pub use handle::SchedulerHandle;
pub use registry::{JobRegistration, JobRegistry};
pub use types::{SchedulerError, SchedulerState, TickReport};
