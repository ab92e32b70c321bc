//! Graceful shutdown integration tests.
//!
//! Shutdown waits for in-flight slices up to the shutdown timeout and then
//! hands every lock the node holds back to the cluster.

use crate::common::{
    Registration, WAIT, WIDTH, slice, start_configured_node, start_node, start_time,
};
use slicer::scheduler::advance_lock_name;
use slicer::testing::{BlockingExecutor, RecordingExecutor};
use slicer::{
    InMemoryStorage, ManualClock, Scheduler, SchedulerError, SchedulerState, Storage, Trigger,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Test: shutdown lets a running job finish before returning.
#[tokio::test]
async fn test_shutdown_waits_for_running_job() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let executor = Arc::new(RecordingExecutor::new().with_delay(Duration::from_millis(200)));
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("WORK", executor.clone())],
    )
    .await;

    let job = handle
        .schedule_job(
            "WORK",
            "slow",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();

    clock.set(slice(1).start());
    handle.tick().await.unwrap();

    let started = std::time::Instant::now();
    handle.shutdown().await.unwrap();
    assert!(started.elapsed() < WAIT);

    assert_eq!(executor.job_ids(), vec![job.job_id]);
    assert!(watcher.finished_slices().contains(&slice(1)));
    assert!(matches!(
        storage.get_job(&job.job_id).await,
        Err(slicer::StorageError::NotFound(_))
    ));
    assert_eq!(handle.held_locks(), 0);
    assert_eq!(handle.state().await, SchedulerState::Stopped);
}

/// Test: a job outliving the shutdown timeout is abandoned and its slice
/// lock released.
#[tokio::test]
async fn test_shutdown_timeout_releases_locks() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let blocking = Arc::new(BlockingExecutor::new());
    let (handle, _) = start_configured_node(
        Scheduler::with_storage(Arc::clone(&storage))
            .with_shutdown_timeout(Duration::from_millis(100)),
        &clock,
        "node-a",
        vec![Registration::new("WORK", blocking.clone())],
    )
    .await;

    let job = handle
        .schedule_job(
            "WORK",
            "stuck",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();

    clock.set(slice(1).start());
    handle.tick().await.unwrap();
    assert!(blocking.wait_started(1, WAIT).await);
    assert!(handle.held_locks() > 0);

    let started = std::time::Instant::now();
    handle.shutdown().await.unwrap();
    assert!(started.elapsed() < WAIT);

    assert_eq!(blocking.finished(), 0);
    assert_eq!(handle.held_locks(), 0);
    let lock = storage.get_lock(&advance_lock_name(slice(1))).await.unwrap();
    assert!(lock.is_none_or(|l| l.is_free()));

    // The job stays persisted for another node to pick up
    let stored = storage.get_job(&job.job_id).await.unwrap();
    assert_eq!(stored.job_id, job.job_id);
    assert!(
        storage
            .get_slice_status(slice(1))
            .await
            .unwrap()
            .pending()
            .contains(&job.job_id)
    );
    assert_eq!(storage.get_active_queue().await.unwrap(), Some(slice(1)));

    blocking.release();
}

/// Test: an idle node stops immediately and rejects further commands.
#[tokio::test]
async fn test_shutdown_without_running_jobs() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let (handle, _) = start_node(Arc::clone(&storage), &clock, "node-a", Vec::new()).await;

    handle.tick().await.unwrap();

    let started = std::time::Instant::now();
    handle.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(handle.state().await, SchedulerState::Stopped);
    assert_eq!(handle.held_locks(), 0);

    assert!(matches!(
        handle.tick().await,
        Err(SchedulerError::ChannelError(_))
    ));
}

/// Test: submissions after shutdown are refused and nothing is persisted.
#[tokio::test]
async fn test_submission_after_shutdown_rejected() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let (handle, _) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("WORK", Arc::new(RecordingExecutor::new()))],
    )
    .await;

    handle.shutdown().await.unwrap();

    let result = handle
        .schedule_job(
            "WORK",
            "too-late",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await;
    assert!(matches!(result, Err(SchedulerError::Stopped)));
    assert!(storage.list_jobs().await.unwrap().is_empty());
}
