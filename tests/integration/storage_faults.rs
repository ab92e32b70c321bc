//! Recovery from storage errors while running a slice.
//!
//! A [`FlakyStorage`] wrapper fails chosen calls; the affected job must be
//! picked up again on a later tick and the active queue must hold until then.

use crate::common::{Registration, WAIT, WIDTH, slice, start_node, start_time, wait_for_slice};
use slicer::testing::{FailingExecutor, FlakyStorage, RecordingExecutor, SliceWatcher};
use slicer::{
    BoundedRetry, InMemoryStorage, ManualClock, SchedulerHandle, Storage, StorageError,
    TimeSlice, Trigger,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Tick until `slice` finishes. A tick that lands while the previous drain
/// is still running does nothing, so keep trying.
async fn tick_until_finished<S: Storage + 'static>(
    handle: &SchedulerHandle<S>,
    watcher: &SliceWatcher,
    slice: TimeSlice,
) {
    for _ in 0..50 {
        handle.tick().await.unwrap();
        if watcher.wait_for_slice(slice, Duration::from_millis(100)).await {
            return;
        }
    }
    panic!("slice {} never finished", slice);
}

/// Test: a failed job load holds the slice, and the next tick runs the job.
#[tokio::test]
async fn test_failed_load_is_retried_next_tick() {
    let storage = Arc::new(FlakyStorage::new(InMemoryStorage::new()));
    let clock = ManualClock::new(start_time());
    let executor = Arc::new(RecordingExecutor::new());
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
            "unlucky",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();
    storage.fail_get_job(1);

    clock.set(slice(1).start());
    handle.tick().await.unwrap();
    assert!(storage.wait_for_injected(1, WAIT).await);

    assert!(!watcher.wait_for_slice(slice(1), Duration::from_millis(100)).await);
    assert_eq!(executor.count(), 0);
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(1)));

    tick_until_finished(&handle, &watcher, slice(1)).await;

    assert_eq!(executor.job_ids(), vec![job.job_id]);
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(2)));
    assert!(matches!(
        storage.get_job(&job.job_id).await,
        Err(StorageError::NotFound(_))
    ));

    handle.shutdown().await.unwrap();
}

/// Test: a failed finish write holds the slice until a later tick records it.
#[tokio::test]
async fn test_failed_finish_write_holds_slice() {
    let storage = Arc::new(FlakyStorage::new(InMemoryStorage::new()));
    let clock = ManualClock::new(start_time());
    let executor = Arc::new(RecordingExecutor::new());
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("WORK", executor.clone())],
    )
    .await;

    handle
        .schedule_job(
            "WORK",
            "unrecorded",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();
    storage.fail_add_finished(1);

    clock.set(slice(1).start());
    handle.tick().await.unwrap();
    assert!(storage.wait_for_injected(1, WAIT).await);

    assert!(!watcher.wait_for_slice(slice(1), Duration::from_millis(100)).await);
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(1)));

    tick_until_finished(&handle, &watcher, slice(1)).await;

    // Delivery is at least once: the unrecorded run is repeated.
    assert_eq!(executor.count(), 2);
    assert!(storage.list_jobs().await.unwrap().is_empty());
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(2)));

    handle.shutdown().await.unwrap();
}

/// Test: a retry whose reschedule was interrupted is not run again before
/// its delay, but still runs in its new slice.
#[tokio::test]
async fn test_interrupted_reschedule_waits_for_new_slice() {
    let storage = Arc::new(FlakyStorage::new(InMemoryStorage::new()));
    let clock = ManualClock::new(start_time());
    let executor = Arc::new(FailingExecutor::new(1));
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![
            Registration::new("FLAKY", executor.clone())
                .with_retry(Arc::new(BoundedRetry::fixed(3, Duration::from_secs(120)))),
        ],
    )
    .await;

    let job = handle
        .schedule_job(
            "FLAKY",
            "flaky",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();
    storage.fail_add_finished(1);

    clock.set(slice(1).start());
    handle.tick().await.unwrap();
    assert!(storage.wait_for_injected(1, WAIT).await);
    assert!(!watcher.wait_for_slice(slice(1), Duration::from_millis(100)).await);

    tick_until_finished(&handle, &watcher, slice(1)).await;

    assert_eq!(executor.call_count(), 1);
    let retried = storage.get_job(&job.job_id).await.unwrap();
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.trigger.trigger_time(), slice(3).start());

    clock.set(slice(3).start());
    handle.tick().await.unwrap();
    wait_for_slice(&watcher, slice(3)).await;

    assert_eq!(executor.call_count(), 2);
    assert!(matches!(
        storage.get_job(&job.job_id).await,
        Err(StorageError::NotFound(_))
    ));

    handle.shutdown().await.unwrap();
}
