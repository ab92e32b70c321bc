//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use slicer::testing::SliceWatcher;
use slicer::{
    JobExecutor, ManualClock, RetryPolicy, Scheduler, SchedulerHandle, Storage, TimeSlice,
};
use std::sync::Arc;
use std::time::Duration;

/// Slice width used by the integration tests.
pub const WIDTH: Duration = Duration::from_secs(60);

/// Upper bound for any wait on background work.
pub const WAIT: Duration = Duration::from_secs(5);

/// A slice-aligned instant every test starts from.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// The slice `n` widths after the start.
pub fn slice(n: i64) -> TimeSlice {
    TimeSlice::containing(start_time(), WIDTH).offset(n, WIDTH)
}

/// A job type and the executor and retry policy serving it.
pub struct Registration {
    pub job_type: &'static str,
    pub executor: Arc<dyn JobExecutor>,
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl Registration {
    pub fn new(job_type: &'static str, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            job_type,
            executor,
            retry_policy: None,
        }
    }

    pub fn with_retry(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Start a manually ticked node on `storage` driven by `clock`.
pub async fn start_node<S: Storage + 'static>(
    storage: Arc<S>,
    clock: &ManualClock,
    node_id: &str,
    registrations: Vec<Registration>,
) -> (SchedulerHandle<S>, Arc<SliceWatcher>) {
    start_configured_node(
        Scheduler::with_storage(storage),
        clock,
        node_id,
        registrations,
    )
    .await
}

/// Like [`start_node`] for a scheduler with extra settings applied.
pub async fn start_configured_node<S: Storage + 'static>(
    scheduler: Scheduler<S>,
    clock: &ManualClock,
    node_id: &str,
    registrations: Vec<Registration>,
) -> (SchedulerHandle<S>, Arc<SliceWatcher>) {
    let mut scheduler = scheduler
        .with_clock(Arc::new(clock.clone()))
        .with_slice_width(WIDTH)
        .with_node_id(node_id)
        .with_manual_ticks();
    for registration in registrations {
        scheduler.register(
            registration.job_type,
            registration.executor,
            registration.retry_policy,
        );
    }

    let watcher = Arc::new(SliceWatcher::new());
    scheduler.event_bus().register(watcher.clone()).await;

    let (handle, _task) = scheduler.start().await;
    (handle, watcher)
}

/// Wait for `slice` to finish, failing the test on timeout.
pub async fn wait_for_slice(watcher: &SliceWatcher, slice: TimeSlice) {
    assert!(
        watcher.wait_for_slice(slice, WAIT).await,
        "timeout waiting for slice {} to finish, finished so far: {:?}",
        slice,
        watcher.finished_slices()
    );
}
