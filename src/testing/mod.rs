//! Testing utilities for users of the slicer library.
//!
//! This module provides helpers for testing scheduled jobs:
//!
//! - [`RecordingExecutor`]: Records every job it runs
//! - [`FailingExecutor`]: Fails N times then succeeds
//! - [`BlockingExecutor`]: Holds jobs until released
//! - [`SliceWatcher`]: Event handler that waits for slices to finish
//! - [`RecordingMetricsService`]: In-memory stand-in for the data layer
//! - [`FlakyStorage`]: Storage wrapper that fails selected calls on demand

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::core::executor::{BoxError, JobError, JobExecutor};
use crate::core::job::JobDetails;
use crate::core::types::{JobId, TimeSlice};
use crate::events::{Event, EventHandler};
use crate::jobs::{MetricType, MetricsService};
use crate::storage::{Consistency, SliceStatus, Storage, StorageError, StoredLock};

pub use crate::config::StaticConfigurationService;

/// Wait until `done` holds, re-checking whenever `notify` fires.
async fn wait_until(notify: &Notify, timeout: Duration, done: impl Fn() -> bool) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            let notified = notify.notified();
            if done() {
                return;
            }
            notified.await;
        }
    })
    .await
    .is_ok()
}

/// An executor that records each job it runs.
///
/// # Example
///
/// ```
/// use slicer::testing::RecordingExecutor;
///
/// let executor = RecordingExecutor::new();
/// assert_eq!(executor.count(), 0);
/// ```
#[derive(Default)]
pub struct RecordingExecutor {
    executions: Mutex<Vec<JobDetails>>,
    delay: Option<Duration>,
    notify: Notify,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` before returning from each execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Jobs run so far, in completion order.
    pub fn executions(&self) -> Vec<JobDetails> {
        self.executions
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Ids of the jobs run so far.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.executions().iter().map(|job| job.job_id).collect()
    }

    /// Number of executions.
    pub fn count(&self) -> usize {
        self.executions.lock().map(|e| e.len()).unwrap_or_default()
    }

    /// Wait until at least `n` executions have completed.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        wait_until(&self.notify, timeout, || self.count() >= n).await
    }
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn execute(&self, job: &JobDetails) -> Result<(), JobError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut executions) = self.executions.lock() {
            executions.push(job.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

/// An executor that fails a number of times before succeeding.
///
/// # Example
///
/// ```
/// use slicer::testing::FailingExecutor;
///
/// // Fails twice, then succeeds
/// let executor = FailingExecutor::new(2);
/// assert_eq!(executor.call_count(), 0);
/// ```
pub struct FailingExecutor {
    failures_remaining: AtomicU32,
    error: fn(String) -> JobError,
    message: String,
    attempts: Mutex<Vec<JobDetails>>,
    notify: Notify,
}

impl FailingExecutor {
    /// Fail `fail_count` times with `ExecutionFailed`, then succeed.
    pub fn new(fail_count: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(fail_count),
            error: JobError::ExecutionFailed,
            message: "intentional test failure".to_string(),
            attempts: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Never succeed.
    pub fn always() -> Self {
        Self::new(u32::MAX)
    }

    /// Fail with `Transient` errors instead.
    pub fn transient(mut self) -> Self {
        self.error = JobError::Transient;
        self
    }

    /// Use a custom error message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Every job handed to the executor, in call order.
    pub fn attempts(&self) -> Vec<JobDetails> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Number of times the executor has been called.
    pub fn call_count(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or_default()
    }

    /// Wait until the executor has been called at least `n` times.
    pub async fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        wait_until(&self.notify, timeout, || self.call_count() >= n).await
    }
}

#[async_trait]
impl JobExecutor for FailingExecutor {
    async fn execute(&self, job: &JobDetails) -> Result<(), JobError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(job.clone());
        }
        self.notify.notify_waiters();

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err((self.error)(self.message.clone()))
        } else {
            Ok(())
        }
    }
}

/// An executor whose jobs stay running until [`BlockingExecutor::release`].
#[derive(Default)]
pub struct BlockingExecutor {
    started: AtomicU32,
    finished: AtomicU32,
    released: AtomicBool,
    gate: Notify,
    progress: Notify,
}

impl BlockingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let every current and future job complete.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` jobs are running or have run.
    pub async fn wait_started(&self, n: u32, timeout: Duration) -> bool {
        wait_until(&self.progress, timeout, || self.started() >= n).await
    }
}

#[async_trait]
impl JobExecutor for BlockingExecutor {
    async fn execute(&self, _job: &JobDetails) -> Result<(), JobError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.progress.notify_waiters();

        loop {
            let notified = self.gate.notified();
            if self.released.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }

        self.finished.fetch_add(1, Ordering::SeqCst);
        self.progress.notify_waiters();
        Ok(())
    }
}

/// Event handler that records events and lets tests wait on them.
#[derive(Default)]
pub struct SliceWatcher {
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

impl SliceWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events seen so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Slices reported finished, in emission order.
    pub fn finished_slices(&self) -> Vec<TimeSlice> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                Event::TimeSliceFinished { time_slice, .. } => Some(*time_slice),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|event| predicate(event)).count())
            .unwrap_or_default()
    }

    /// Wait until `slice` is reported finished.
    pub async fn wait_for_slice(&self, slice: TimeSlice, timeout: Duration) -> bool {
        self.wait_for_event(
            |event| matches!(event, Event::TimeSliceFinished { time_slice, .. } if *time_slice == slice),
            timeout,
        )
        .await
    }

    /// Wait until an event matching `predicate` has been recorded.
    pub async fn wait_for_event(
        &self,
        predicate: impl Fn(&Event) -> bool,
        timeout: Duration,
    ) -> bool {
        wait_until(&self.notify, timeout, || self.count(&predicate) > 0).await
    }
}

#[async_trait]
impl EventHandler for SliceWatcher {
    async fn handle(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        self.notify.notify_waiters();
    }
}

#[derive(Default)]
struct MetricsCalls {
    deleted_tenants: Vec<String>,
    deleted_metrics: Vec<(String, MetricType, String)>,
    compressed_blocks: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    fail_next: Option<String>,
}

/// Metrics service that records calls instead of touching data.
#[derive(Default)]
pub struct RecordingMetricsService {
    calls: Mutex<MetricsCalls>,
}

impl RecordingMetricsService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.fail_next = Some(message.into());
        }
    }

    pub fn deleted_tenants(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.deleted_tenants.clone())
            .unwrap_or_default()
    }

    pub fn deleted_metrics(&self) -> Vec<(String, MetricType, String)> {
        self.calls
            .lock()
            .map(|c| c.deleted_metrics.clone())
            .unwrap_or_default()
    }

    pub fn compressed_blocks(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.calls
            .lock()
            .map(|c| c.compressed_blocks.clone())
            .unwrap_or_default()
    }

    fn record(&self, apply: impl FnOnce(&mut MetricsCalls)) -> Result<(), BoxError> {
        let mut calls = self.calls.lock().map_err(|_| "metrics calls lock poisoned")?;
        if let Some(message) = calls.fail_next.take() {
            return Err(message.into());
        }
        apply(&mut calls);
        Ok(())
    }
}

#[async_trait]
impl MetricsService for RecordingMetricsService {
    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), BoxError> {
        self.record(|calls| calls.deleted_tenants.push(tenant_id.to_string()))
    }

    async fn delete_metric(
        &self,
        tenant_id: &str,
        metric_type: MetricType,
        metric_name: &str,
    ) -> Result<(), BoxError> {
        self.record(|calls| {
            calls
                .deleted_metrics
                .push((tenant_id.to_string(), metric_type, metric_name.to_string()))
        })
    }

    async fn compress_block(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), BoxError> {
        self.record(|calls| calls.compressed_blocks.push((start, end)))
    }
}

/// Storage wrapper that fails chosen calls a set number of times.
///
/// Everything else goes straight to the wrapped storage.
pub struct FlakyStorage<S> {
    inner: S,
    get_job_failures: AtomicU32,
    update_job_failures: AtomicU32,
    add_finished_failures: AtomicU32,
    injected: AtomicU32,
    notify: Notify,
}

impl<S: Storage> FlakyStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            get_job_failures: AtomicU32::new(0),
            update_job_failures: AtomicU32::new(0),
            add_finished_failures: AtomicU32::new(0),
            injected: AtomicU32::new(0),
            notify: Notify::new(),
        }
    }

    /// Fail the next `times` job loads.
    pub fn fail_get_job(&self, times: u32) {
        self.get_job_failures.store(times, Ordering::SeqCst);
    }

    /// Fail the next `times` job row updates.
    pub fn fail_update_job(&self, times: u32) {
        self.update_job_failures.store(times, Ordering::SeqCst);
    }

    /// Fail the next `times` finished-set writes.
    pub fn fail_add_finished(&self, times: u32) {
        self.add_finished_failures.store(times, Ordering::SeqCst);
    }

    /// Number of failures returned so far.
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` failures have been returned.
    pub async fn wait_for_injected(&self, count: u32, timeout: Duration) -> bool {
        wait_until(&self.notify, timeout, || self.injected() >= count).await
    }

    fn inject(&self, remaining: &AtomicU32, call: &str) -> Result<(), StorageError> {
        if remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Ok(());
        }
        self.injected.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Err(StorageError::Other(format!("injected {} failure", call)))
    }
}

#[async_trait]
impl<S: Storage> Storage for FlakyStorage<S> {
    fn consistency(&self) -> Consistency {
        self.inner.consistency()
    }

    async fn insert_job(&self, job: JobDetails) -> Result<(), StorageError> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: &JobId) -> Result<JobDetails, StorageError> {
        self.inject(&self.get_job_failures, "get_job")?;
        self.inner.get_job(id).await
    }

    async fn update_job(&self, job: JobDetails) -> Result<(), StorageError> {
        self.inject(&self.update_job_failures, "update_job")?;
        self.inner.update_job(job).await
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError> {
        self.inner.delete_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<JobDetails>, StorageError> {
        self.inner.list_jobs().await
    }

    async fn add_scheduled(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        self.inner.add_scheduled(slice, id).await
    }

    async fn remove_scheduled(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        self.inner.remove_scheduled(slice, id).await
    }

    async fn add_active(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        self.inner.add_active(slice, id).await
    }

    async fn add_finished(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        self.inject(&self.add_finished_failures, "add_finished")?;
        self.inner.add_finished(slice, id).await
    }

    async fn get_slice_status(&self, slice: TimeSlice) -> Result<SliceStatus, StorageError> {
        self.inner.get_slice_status(slice).await
    }

    async fn delete_slice(&self, slice: TimeSlice) -> Result<(), StorageError> {
        self.inner.delete_slice(slice).await
    }

    async fn list_slices(&self) -> Result<Vec<TimeSlice>, StorageError> {
        self.inner.list_slices().await
    }

    async fn get_active_queue(&self) -> Result<Option<TimeSlice>, StorageError> {
        self.inner.get_active_queue().await
    }

    async fn init_active_queue(&self, slice: TimeSlice) -> Result<bool, StorageError> {
        self.inner.init_active_queue(slice).await
    }

    async fn advance_active_queue(
        &self,
        expected: TimeSlice,
        next: TimeSlice,
    ) -> Result<bool, StorageError> {
        self.inner.advance_active_queue(expected, next).await
    }

    async fn try_lock_exclusive(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        self.inner.try_lock_exclusive(name, owner).await
    }

    async fn try_lock_shared(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        self.inner.try_lock_shared(name, owner, ttl).await
    }

    async fn unlock_shared(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        self.inner.unlock_shared(name, owner).await
    }

    async fn unlock_exclusive(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        self.inner.unlock_exclusive(name, owner).await
    }

    async fn get_lock(&self, name: &str) -> Result<Option<StoredLock>, StorageError> {
        self.inner.get_lock(name).await
    }
}
