//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and single-process
//! deployments. Conditional writes are atomic under the table's write guard.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::{Consistency, SliceStatus, Storage, StorageError, StoredLock};
use crate::core::clock::{Clock, SystemClock};
use crate::core::job::JobDetails;
use crate::core::types::{JobId, TimeSlice};

#[derive(Debug, Default)]
struct LockEntry {
    owner: Option<String>,
    shared: HashMap<String, DateTime<Utc>>,
}

impl LockEntry {
    fn expire(&mut self, now: DateTime<Utc>) {
        self.shared.retain(|_, expires_at| *expires_at > now);
    }

    fn is_free(&self) -> bool {
        self.owner.is_none() && self.shared.is_empty()
    }
}

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts. Share one instance between
/// schedulers (via `Arc`) to simulate a cluster.
pub struct InMemoryStorage {
    jobs: RwLock<HashMap<JobId, JobDetails>>,
    slices: RwLock<BTreeMap<TimeSlice, SliceStatus>>,
    active_queue: RwLock<Option<TimeSlice>>,
    locks: RwLock<HashMap<String, LockEntry>>,
    clock: Arc<dyn Clock>,
    consistency: Consistency,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            slices: RwLock::new(BTreeMap::new()),
            active_queue: RwLock::new(None),
            locks: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            consistency: Consistency::default(),
        }
    }

    /// Use `clock` for shared-lock expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record the consistency level this session runs at.
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    fn update_slice<F>(&self, slice: TimeSlice, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut SliceStatus),
    {
        let mut slices = self.slices.write().map_err(|_| StorageError::LockPoisoned)?;
        let status = slices
            .entry(slice)
            .or_insert_with(|| SliceStatus::empty(slice));
        f(status);
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    fn consistency(&self) -> Consistency {
        self.consistency
    }

    async fn insert_job(&self, job: JobDetails) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        if jobs.contains_key(&job.job_id) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.job_id)));
        }
        jobs.insert(job.job_id, job);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<JobDetails, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn update_job(&self, job: JobDetails) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        if !jobs.contains_key(&job.job_id) {
            return Err(StorageError::NotFound(format!("job: {}", job.job_id)));
        }
        jobs.insert(job.job_id, job);
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        jobs.remove(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobDetails>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs.values().cloned().collect();
        result.sort_by(|a, b| {
            a.trigger
                .trigger_time()
                .cmp(&b.trigger.trigger_time())
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(result)
    }

    async fn add_scheduled(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        self.update_slice(slice, |s| {
            s.scheduled.insert(*id);
        })
    }

    async fn remove_scheduled(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        let mut slices = self.slices.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(status) = slices.get_mut(&slice) {
            status.scheduled.remove(id);
        }
        Ok(())
    }

    async fn add_active(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        self.update_slice(slice, |s| {
            s.active.insert(*id);
        })
    }

    async fn add_finished(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        self.update_slice(slice, |s| {
            s.finished.insert(*id);
        })
    }

    async fn get_slice_status(&self, slice: TimeSlice) -> Result<SliceStatus, StorageError> {
        let slices = self.slices.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(slices
            .get(&slice)
            .cloned()
            .unwrap_or_else(|| SliceStatus::empty(slice)))
    }

    async fn delete_slice(&self, slice: TimeSlice) -> Result<(), StorageError> {
        let mut slices = self.slices.write().map_err(|_| StorageError::LockPoisoned)?;
        slices.remove(&slice);
        Ok(())
    }

    async fn list_slices(&self) -> Result<Vec<TimeSlice>, StorageError> {
        let slices = self.slices.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(slices.keys().copied().collect())
    }

    async fn get_active_queue(&self) -> Result<Option<TimeSlice>, StorageError> {
        let pointer = self
            .active_queue
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(*pointer)
    }

    async fn init_active_queue(&self, slice: TimeSlice) -> Result<bool, StorageError> {
        let mut pointer = self
            .active_queue
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if pointer.is_some() {
            return Ok(false);
        }
        *pointer = Some(slice);
        Ok(true)
    }

    async fn advance_active_queue(
        &self,
        expected: TimeSlice,
        next: TimeSlice,
    ) -> Result<bool, StorageError> {
        let mut pointer = self
            .active_queue
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if *pointer != Some(expected) {
            return Ok(false);
        }
        *pointer = Some(next);
        Ok(true)
    }

    async fn try_lock_exclusive(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let mut locks = self.locks.write().map_err(|_| StorageError::LockPoisoned)?;
        let entry = locks.entry(name.to_string()).or_default();
        entry.expire(now);

        if !entry.shared.is_empty() {
            return Ok(false);
        }
        match entry.owner.as_deref() {
            None => {
                entry.owner = Some(owner.to_string());
                Ok(true)
            }
            Some(current) => Ok(current == owner),
        }
    }

    async fn try_lock_shared(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut locks = self.locks.write().map_err(|_| StorageError::LockPoisoned)?;
        let entry = locks.entry(name.to_string()).or_default();
        entry.expire(now);

        if entry.owner.is_some() {
            return Ok(false);
        }
        entry.shared.insert(owner.to_string(), expires_at);
        Ok(true)
    }

    async fn unlock_shared(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let mut locks = self.locks.write().map_err(|_| StorageError::LockPoisoned)?;
        let Some(entry) = locks.get_mut(name) else {
            return Ok(false);
        };
        entry.expire(now);

        let removed = entry.owner.is_none() && entry.shared.remove(owner).is_some();
        if entry.is_free() {
            locks.remove(name);
        }
        Ok(removed)
    }

    async fn unlock_exclusive(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let mut locks = self.locks.write().map_err(|_| StorageError::LockPoisoned)?;
        let Some(entry) = locks.get_mut(name) else {
            return Ok(false);
        };
        entry.expire(now);

        let released = entry.owner.as_deref() == Some(owner);
        if released {
            entry.owner = None;
        }
        if entry.is_free() {
            locks.remove(name);
        }
        Ok(released)
    }

    async fn get_lock(&self, name: &str) -> Result<Option<StoredLock>, StorageError> {
        let now = self.clock.now();
        let locks = self.locks.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(locks.get(name).and_then(|entry| {
            let lock = StoredLock {
                name: name.to_string(),
                exclusive_owner: entry.owner.clone(),
                shared_owners: entry
                    .shared
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(owner, expires_at)| (owner.clone(), *expires_at))
                    .collect(),
            };
            (!lock.is_free()).then_some(lock)
        }))
    }
}
