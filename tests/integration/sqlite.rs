//! Scheduler runs against the SQLite backend.

use crate::common::{Registration, WIDTH, slice, start_node, start_time, wait_for_slice};
use slicer::testing::{FailingExecutor, RecordingExecutor};
use slicer::{BoundedRetry, ManualClock, SqliteStorage, Storage, Trigger};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Test: single, repeating and retried jobs go through a full cycle.
#[tokio::test]
async fn test_full_cycle_on_sqlite() {
    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let clock = ManualClock::new(start_time());
    let work = Arc::new(RecordingExecutor::new());
    let flaky = Arc::new(FailingExecutor::new(1));
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![
            Registration::new("WORK", work.clone()),
            Registration::new("FLAKY", flaky.clone())
                .with_retry(Arc::new(BoundedRetry::fixed(3, Duration::from_secs(60)))),
        ],
    )
    .await;

    let single = handle
        .schedule_job(
            "WORK",
            "once",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();
    let repeating = handle
        .schedule_job(
            "WORK",
            "every-minute",
            BTreeMap::new(),
            Trigger::repeating(slice(1).start(), WIDTH, WIDTH).unwrap(),
        )
        .await
        .unwrap();
    let retried = handle
        .schedule_job(
            "FLAKY",
            "flaky",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();

    clock.set(slice(1).start());
    handle.tick().await.unwrap();
    wait_for_slice(&watcher, slice(1)).await;

    assert_eq!(work.count(), 2);
    assert!(matches!(
        storage.get_job(&single.job_id).await,
        Err(slicer::StorageError::NotFound(_))
    ));
    let rearmed = storage.get_job(&repeating.job_id).await.unwrap();
    assert_eq!(rearmed.trigger.trigger_time(), slice(2).start());
    let failed_once = storage.get_job(&retried.job_id).await.unwrap();
    assert_eq!(failed_once.retry_count, 1);
    assert_eq!(failed_once.trigger.trigger_time(), slice(2).start());
    assert!(storage.get_slice_status(slice(1)).await.unwrap().scheduled.is_empty());

    clock.set(slice(2).start());
    handle.tick().await.unwrap();
    wait_for_slice(&watcher, slice(2)).await;

    assert_eq!(work.count(), 3);
    assert_eq!(flaky.call_count(), 2);
    assert!(matches!(
        storage.get_job(&retried.job_id).await,
        Err(slicer::StorageError::NotFound(_))
    ));
    assert_eq!(storage.get_active_queue().await.unwrap(), Some(slice(3)));

    handle.shutdown().await.unwrap();
}

/// Test: jobs and the active queue survive a node restart.
#[tokio::test]
async fn test_jobs_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("slicer.db");
    let clock = ManualClock::new(start_time());

    let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
    let (handle, _) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("WORK", Arc::new(RecordingExecutor::new()))],
    )
    .await;
    let job = handle
        .schedule_job(
            "WORK",
            "durable",
            BTreeMap::new(),
            Trigger::single_at(slice(2).start(), WIDTH),
        )
        .await
        .unwrap();
    handle.shutdown().await.unwrap();
    storage.close().await;

    let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
    assert_eq!(storage.get_active_queue().await.unwrap(), Some(slice(0)));

    let executor = Arc::new(RecordingExecutor::new());
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-b",
        vec![Registration::new("WORK", executor.clone())],
    )
    .await;

    clock.set(slice(2).start());
    handle.tick().await.unwrap();
    wait_for_slice(&watcher, slice(2)).await;

    assert_eq!(executor.job_ids(), vec![job.job_id]);
    handle.shutdown().await.unwrap();
    storage.close().await;
}
