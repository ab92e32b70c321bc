//! Storage abstraction for jobs, the time-slice index, the active queue
//! pointer and named locks.
//!
//! This module provides a trait-based session abstraction with pluggable
//! backends (in-memory, SQLite). Every cluster-visible mutation that must
//! not race is exposed as a conditional write returning whether it applied.

mod memory;
#[cfg(any(feature = "sqlite", test))]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(any(feature = "sqlite", test))]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::core::job::JobDetails;
use crate::core::types::{JobId, TimeSlice};

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Consistency level requested from the session.
///
/// The bundled backends are single-replica, so every level behaves the same;
/// the value is carried so callers and operators can see what was asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    One,
    #[default]
    Quorum,
    Serial,
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Consistency::One => "one",
            Consistency::Quorum => "quorum",
            Consistency::Serial => "serial",
        };
        write!(f, "{}", s)
    }
}

/// Index entries for one time slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceStatus {
    /// The slice these sets belong to.
    pub time_slice: TimeSlice,
    /// Jobs indexed under the slice.
    pub scheduled: BTreeSet<JobId>,
    /// Jobs dispatched to an executor.
    pub active: BTreeSet<JobId>,
    /// Jobs that reached a terminal state for the slice.
    pub finished: BTreeSet<JobId>,
}

impl SliceStatus {
    /// A slice with no index entries.
    pub fn empty(time_slice: TimeSlice) -> Self {
        Self {
            time_slice,
            scheduled: BTreeSet::new(),
            active: BTreeSet::new(),
            finished: BTreeSet::new(),
        }
    }

    /// Scheduled jobs not yet finished.
    pub fn pending(&self) -> BTreeSet<JobId> {
        self.scheduled.difference(&self.finished).copied().collect()
    }

    /// Whether every scheduled job is finished.
    pub fn is_drained(&self) -> bool {
        self.scheduled.is_subset(&self.finished)
    }
}

/// Current state of a named lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredLock {
    /// Lock name.
    pub name: String,
    /// Exclusive owner, if any.
    pub exclusive_owner: Option<String>,
    /// Live shared owners with their expiry.
    pub shared_owners: BTreeMap<String, DateTime<Utc>>,
}

impl StoredLock {
    /// Whether nobody holds the lock.
    pub fn is_free(&self) -> bool {
        self.exclusive_owner.is_none() && self.shared_owners.is_empty()
    }
}

/// Asynchronous storage session used by the scheduler.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Consistency level this session runs at.
    fn consistency(&self) -> Consistency;

    // Job operations

    /// Persist a new job.
    async fn insert_job(&self, job: JobDetails) -> Result<(), StorageError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &JobId) -> Result<JobDetails, StorageError>;

    /// Replace an existing job row.
    async fn update_job(&self, job: JobDetails) -> Result<(), StorageError>;

    /// Delete a job by ID.
    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError>;

    /// List all jobs, ordered by trigger time.
    async fn list_jobs(&self) -> Result<Vec<JobDetails>, StorageError>;

    // Time-slice index operations. These are idempotent plain writes.

    /// Index a job under a slice.
    async fn add_scheduled(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError>;

    /// Remove a job from a slice's scheduled set.
    async fn remove_scheduled(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError>;

    /// Mark a job as dispatched for a slice.
    async fn add_active(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError>;

    /// Mark a job as terminal for a slice.
    async fn add_finished(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError>;

    /// Read all index sets for a slice.
    async fn get_slice_status(&self, slice: TimeSlice) -> Result<SliceStatus, StorageError>;

    /// Drop every index entry for a slice.
    async fn delete_slice(&self, slice: TimeSlice) -> Result<(), StorageError>;

    /// Slices that currently have index entries, in order.
    async fn list_slices(&self) -> Result<Vec<TimeSlice>, StorageError>;

    // Active queue pointer

    /// Read the pointer, if it has been initialised.
    async fn get_active_queue(&self) -> Result<Option<TimeSlice>, StorageError>;

    /// Initialise the pointer if it is absent. Returns whether the write applied.
    async fn init_active_queue(&self, slice: TimeSlice) -> Result<bool, StorageError>;

    /// Move the pointer from `expected` to `next`. Returns whether the write applied.
    async fn advance_active_queue(
        &self,
        expected: TimeSlice,
        next: TimeSlice,
    ) -> Result<bool, StorageError>;

    // Named locks

    /// Take exclusive ownership if nobody else holds the lock in any mode.
    ///
    /// Re-acquiring a lock already held exclusively by `owner` succeeds.
    async fn try_lock_exclusive(&self, name: &str, owner: &str) -> Result<bool, StorageError>;

    /// Join the shared owners if there is no exclusive owner.
    ///
    /// The entry expires after `ttl` unless renewed by another call.
    async fn try_lock_shared(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Leave the shared owners. Returns whether `owner` was removed.
    async fn unlock_shared(&self, name: &str, owner: &str) -> Result<bool, StorageError>;

    /// Give up exclusive ownership. Returns whether `owner` held it.
    async fn unlock_exclusive(&self, name: &str, owner: &str) -> Result<bool, StorageError>;

    /// Inspect a lock.
    async fn get_lock(&self, name: &str) -> Result<Option<StoredLock>, StorageError>;
}
