//! Core scheduling types: identifiers, time slices, triggers, jobs,
//! executors and retry policies.

pub mod clock;
pub mod executor;
pub mod job;
pub mod retry;
pub mod trigger;
pub mod types;
