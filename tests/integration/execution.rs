//! End-to-end execution tests.
//!
//! Jobs are submitted through the handle, the clock is moved by hand and
//! ticks are driven explicitly, so every scenario is deterministic.

use crate::common::{Registration, WIDTH, slice, start_node, start_time, wait_for_slice};
use slicer::testing::{BlockingExecutor, FailingExecutor, RecordingExecutor};
use slicer::{
    BoundedRetry, Event, InMemoryStorage, JobDetails, ManualClock, SchedulerError, Storage,
    StorageError, SubmissionError, Trigger,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Test: every job indexed under a slice runs exactly once.
#[tokio::test]
async fn test_all_jobs_in_slice_run_once() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let executor = Arc::new(RecordingExecutor::new());
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("WORK", executor.clone())],
    )
    .await;

    let due = slice(1);
    let mut ids = Vec::new();
    for i in 0..10 {
        let job = handle
            .schedule_job(
                "WORK",
                format!("work-{}", i),
                BTreeMap::new(),
                Trigger::single_at(due.start(), WIDTH),
            )
            .await
            .unwrap();
        ids.push(job.job_id);
    }
    assert_eq!(handle.slice_status(due).await.unwrap().scheduled.len(), 10);

    clock.set(due.start());
    let report = handle.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![slice(0), due]);

    wait_for_slice(&watcher, due).await;

    let mut ran = executor.job_ids();
    ran.sort();
    ids.sort();
    assert_eq!(ran, ids);
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(2)));
    assert_eq!(watcher.finished_slices(), vec![slice(0), due]);
    assert!(handle.list_jobs().await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
}

/// Test: ticking without due jobs only advances the pointer.
#[tokio::test]
async fn test_future_jobs_are_not_dispatched_early() {
    let storage = Arc::new(InMemoryStorage::new());
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
            "later",
            BTreeMap::new(),
            Trigger::single_at(slice(5).start(), WIDTH),
        )
        .await
        .unwrap();

    let report = handle.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![slice(0)]);
    wait_for_slice(&watcher, slice(0)).await;

    assert_eq!(executor.count(), 0);
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(1)));

    handle.shutdown().await.unwrap();
}

/// Test: a node that fell behind walks every due slice in one tick.
#[tokio::test]
async fn test_catch_up_processes_missed_slices_in_order() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let executor = Arc::new(RecordingExecutor::new());
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("WORK", executor.clone())],
    )
    .await;

    for n in 1..=3 {
        handle
            .schedule_job(
                "WORK",
                format!("job-{}", n),
                BTreeMap::new(),
                Trigger::single_at(slice(n).start(), WIDTH),
            )
            .await
            .unwrap();
    }

    clock.set(slice(4).start());
    let report = handle.tick().await.unwrap();
    assert_eq!(
        report.dispatched,
        vec![slice(0), slice(1), slice(2), slice(3), slice(4)]
    );

    wait_for_slice(&watcher, slice(4)).await;
    assert_eq!(executor.count(), 3);
    assert_eq!(
        watcher.finished_slices(),
        vec![slice(0), slice(1), slice(2), slice(3), slice(4)]
    );
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(5)));

    handle.shutdown().await.unwrap();
}

/// Test: a long-running job holds its slice while later slices run.
#[tokio::test]
async fn test_long_running_job_holds_active_queue() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let blocking = Arc::new(BlockingExecutor::new());
    let recording = Arc::new(RecordingExecutor::new());
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![
            Registration::new("SLOW", blocking.clone()),
            Registration::new("FAST", recording.clone()),
        ],
    )
    .await;

    handle
        .schedule_job(
            "SLOW",
            "slow",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();
    handle
        .schedule_job(
            "FAST",
            "fast",
            BTreeMap::new(),
            Trigger::single_at(slice(2).start(), WIDTH),
        )
        .await
        .unwrap();

    clock.set(slice(1).start());
    handle.tick().await.unwrap();
    assert!(blocking.wait_started(1, Duration::from_secs(5)).await);
    wait_for_slice(&watcher, slice(0)).await;

    clock.set(slice(2).start());
    let report = handle.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![slice(2)]);
    assert!(recording.wait_for(1, Duration::from_secs(5)).await);

    // The later slice is drained but cannot be advanced past the busy one
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(1)));
    let status = handle.slice_status(slice(1)).await.unwrap();
    assert_eq!(status.active.len(), 1);
    assert!(status.finished.is_empty());

    blocking.release();
    wait_for_slice(&watcher, slice(2)).await;

    assert_eq!(
        watcher.finished_slices(),
        vec![slice(0), slice(1), slice(2)]
    );
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(3)));

    handle.shutdown().await.unwrap();
}

/// Test: a failed job is re-armed into a later slice with a bumped retry count.
#[tokio::test]
async fn test_failed_job_is_rescheduled() {
    let storage = Arc::new(InMemoryStorage::new());
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

    clock.set(slice(1).start());
    handle.tick().await.unwrap();
    wait_for_slice(&watcher, slice(1)).await;

    let retried = handle.get_job(&job.job_id).await.unwrap();
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.trigger.trigger_time(), slice(3).start());
    assert!(!retried.trigger.is_repeating());
    assert!(
        handle
            .slice_status(slice(3))
            .await
            .unwrap()
            .scheduled
            .contains(&job.job_id)
    );
    // The first slice was cleared once it finished
    assert!(handle.slice_status(slice(1)).await.unwrap().scheduled.is_empty());

    assert_eq!(
        watcher.count(|e| matches!(
            e,
            Event::JobFailed { retry_at: Some(at), .. } if *at == slice(3).start()
        )),
        1
    );
    assert_eq!(
        watcher.count(|e| matches!(
            e,
            Event::JobRescheduled { from, to, retry_count: 1, .. }
                if *from == slice(1) && *to == slice(3)
        )),
        1
    );

    clock.set(slice(3).start());
    handle.tick().await.unwrap();
    wait_for_slice(&watcher, slice(3)).await;

    assert_eq!(executor.call_count(), 2);
    assert_eq!(executor.attempts()[1].retry_count, 1);
    assert!(matches!(
        handle.get_job(&job.job_id).await,
        Err(SchedulerError::JobNotFound(_))
    ));

    handle.shutdown().await.unwrap();
}

/// Test: a terminal failure finishes the job without retrying.
#[tokio::test]
async fn test_terminal_failure_retires_job() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let executor = Arc::new(FailingExecutor::always());
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("DOOMED", executor.clone())],
    )
    .await;

    let job = handle
        .schedule_job(
            "DOOMED",
            "doomed",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();

    clock.set(slice(1).start());
    handle.tick().await.unwrap();
    wait_for_slice(&watcher, slice(1)).await;

    assert_eq!(executor.call_count(), 1);
    assert_eq!(
        watcher.count(|e| matches!(e, Event::JobFailed { retry_at: None, .. })),
        1
    );
    assert!(matches!(
        storage.get_job(&job.job_id).await,
        Err(StorageError::NotFound(_))
    ));

    handle.shutdown().await.unwrap();
}

/// Test: a repeating job re-arms itself after each execution.
#[tokio::test]
async fn test_repeating_job_recurs() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let executor = Arc::new(RecordingExecutor::new());
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("PERIODIC", executor.clone())],
    )
    .await;

    let trigger = Trigger::repeating(slice(1).start(), Duration::from_secs(120), WIDTH).unwrap();
    let job = handle
        .schedule_job("PERIODIC", "every-two-minutes", BTreeMap::new(), trigger)
        .await
        .unwrap();

    clock.set(slice(1).start());
    handle.tick().await.unwrap();
    wait_for_slice(&watcher, slice(1)).await;

    let rearmed = handle.get_job(&job.job_id).await.unwrap();
    assert_eq!(rearmed.trigger.trigger_time(), slice(3).start());
    assert_eq!(rearmed.retry_count, 0);

    clock.set(slice(3).start());
    handle.tick().await.unwrap();
    wait_for_slice(&watcher, slice(3)).await;

    assert_eq!(executor.count(), 2);
    let rearmed = handle.get_job(&job.job_id).await.unwrap();
    assert_eq!(rearmed.trigger.trigger_time(), slice(5).start());

    handle.shutdown().await.unwrap();
}

/// Test: a paused scheduler advances drained slices but dispatches nothing new.
#[tokio::test]
async fn test_pause_stops_dispatch() {
    let storage = Arc::new(InMemoryStorage::new());
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
            "paused",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();

    handle.pause().await.unwrap();
    assert!(handle.is_paused().await);

    clock.set(slice(1).start());
    let report = handle.tick().await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(executor.count(), 0);
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(0)));

    handle.resume().await.unwrap();
    let report = handle.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![slice(0), slice(1)]);
    wait_for_slice(&watcher, slice(1)).await;
    assert_eq!(executor.count(), 1);

    handle.shutdown().await.unwrap();
}

/// Test: a stored repeating job whose next occurrence is out of range runs
/// once and is retired without stalling the active queue.
#[tokio::test]
async fn test_out_of_range_recurrence_is_retired() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let executor = Arc::new(RecordingExecutor::new());
    let (handle, watcher) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("WORK", executor.clone())],
    )
    .await;

    let huge = Duration::from_secs(60 * 10u64.pow(16));
    let trigger = Trigger::Repeating {
        trigger_time: slice(1).start(),
        interval: huge,
        repeat_limit: None,
        execution_count: 0,
    };

    let err = handle
        .schedule_job("WORK", "far-apart", BTreeMap::new(), trigger.clone())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::InvalidSubmission(SubmissionError::InvalidTrigger(_))
    ));

    // Rows written before the interval check existed still have to drain.
    let job = JobDetails::new("WORK", "far-apart", BTreeMap::new(), trigger);
    storage.insert_job(job.clone()).await.unwrap();
    storage.add_scheduled(slice(1), &job.job_id).await.unwrap();

    clock.set(slice(1).start());
    handle.tick().await.unwrap();
    wait_for_slice(&watcher, slice(1)).await;

    assert_eq!(executor.job_ids(), vec![job.job_id]);
    assert!(matches!(
        storage.get_job(&job.job_id).await,
        Err(StorageError::NotFound(_))
    ));
    assert_eq!(handle.active_queue().await.unwrap(), Some(slice(2)));

    handle.shutdown().await.unwrap();
}
