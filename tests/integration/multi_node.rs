//! Multi-node tests.
//!
//! Several schedulers sharing one storage act as a cluster: the advance
//! lock of each slice decides which node runs it.

use crate::common::{
    Registration, WAIT, WIDTH, slice, start_configured_node, start_node, start_time,
};
use slicer::testing::{BlockingExecutor, RecordingExecutor};
use slicer::scheduler::advance_lock_name;
use slicer::{
    Event, InMemoryStorage, ManualClock, Scheduler, SchedulerHandle, Storage, TimeSlice, Trigger,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Tick every node until the active queue reaches `target`.
async fn tick_until_pointer<S: Storage + 'static>(
    nodes: &[&SchedulerHandle<S>],
    target: TimeSlice,
) {
    let reached = tokio::time::timeout(WAIT, async {
        loop {
            for node in nodes {
                node.tick().await.unwrap();
            }
            if nodes[0].active_queue().await.unwrap() == Some(target) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "active queue never reached {}", target);
}

/// Test: concurrent ticks on two nodes run each job exactly once.
#[tokio::test]
async fn test_each_job_runs_once_across_nodes() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let on_a = Arc::new(RecordingExecutor::new());
    let on_b = Arc::new(RecordingExecutor::new());
    let (node_a, _) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("WORK", on_a.clone())],
    )
    .await;
    let (node_b, _) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-b",
        vec![Registration::new("WORK", on_b.clone())],
    )
    .await;

    let mut submitted = BTreeSet::new();
    for n in 1..=3 {
        for i in 0..5 {
            let job = node_a
                .schedule_job(
                    "WORK",
                    format!("job-{}-{}", n, i),
                    BTreeMap::new(),
                    Trigger::single_at(slice(n).start(), WIDTH),
                )
                .await
                .unwrap();
            submitted.insert(job.job_id);
        }
    }

    clock.set(slice(3).start());
    let (report_a, report_b) = tokio::join!(node_a.tick(), node_b.tick());
    let (report_a, report_b) = (report_a.unwrap(), report_b.unwrap());

    // Between them the nodes cover every due slice
    for n in 0..=3 {
        assert!(
            report_a.dispatched.contains(&slice(n)) || report_b.dispatched.contains(&slice(n)),
            "slice {} was not dispatched",
            slice(n)
        );
    }

    tick_until_pointer(&[&node_a, &node_b], slice(4)).await;

    let mut ran: Vec<_> = on_a.job_ids();
    ran.extend(on_b.job_ids());
    assert_eq!(ran.len(), submitted.len());
    assert_eq!(ran.into_iter().collect::<BTreeSet<_>>(), submitted);

    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}

/// Test: a node defers a slice whose lock another node holds.
#[tokio::test]
async fn test_contended_slice_is_deferred() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let blocking = Arc::new(BlockingExecutor::new());
    let on_b = Arc::new(RecordingExecutor::new());
    let (node_a, _) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("WORK", blocking.clone())],
    )
    .await;
    let (node_b, watcher_b) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-b",
        vec![Registration::new("WORK", on_b.clone())],
    )
    .await;

    node_a
        .schedule_job(
            "WORK",
            "held",
            BTreeMap::new(),
            Trigger::single_at(slice(0).start(), WIDTH),
        )
        .await
        .unwrap();

    let report = node_a.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![slice(0)]);
    assert!(blocking.wait_started(1, WAIT).await);

    let report = node_b.tick().await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.deferred, vec![slice(0)]);
    assert_eq!(
        watcher_b.count(
            |e| matches!(e, Event::TickDeferred { time_slice, .. } if *time_slice == slice(0))
        ),
        1
    );
    assert_eq!(on_b.count(), 0);

    blocking.release();
    tick_until_pointer(&[&node_a], slice(1)).await;
    assert_eq!(blocking.finished(), 1);
    assert_eq!(on_b.count(), 0);

    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}

/// Test: a slice abandoned by a stopped node is picked up by another.
#[tokio::test]
async fn test_stopped_node_hands_over_slice() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let blocking = Arc::new(BlockingExecutor::new());
    let on_b = Arc::new(RecordingExecutor::new());
    let (node_a, _) = start_configured_node(
        Scheduler::with_storage(Arc::clone(&storage))
            .with_shutdown_timeout(Duration::from_millis(100)),
        &clock,
        "node-a",
        vec![Registration::new("WORK", blocking.clone())],
    )
    .await;
    let (node_b, watcher_b) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-b",
        vec![Registration::new("WORK", on_b.clone())],
    )
    .await;

    let job = node_a
        .schedule_job(
            "WORK",
            "handover",
            BTreeMap::new(),
            Trigger::single_at(slice(0).start(), WIDTH),
        )
        .await
        .unwrap();

    node_a.tick().await.unwrap();
    assert!(blocking.wait_started(1, WAIT).await);

    // Node A gives up on the running job and releases its lock
    node_a.shutdown().await.unwrap();
    let lock = storage
        .get_lock(&advance_lock_name(slice(0)))
        .await
        .unwrap();
    assert!(lock.is_none_or(|l| l.is_free()));

    let report = node_b.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![slice(0)]);
    assert!(watcher_b.wait_for_slice(slice(0), WAIT).await);
    assert_eq!(on_b.job_ids(), vec![job.job_id]);
    assert_eq!(node_b.active_queue().await.unwrap(), Some(slice(1)));

    blocking.release();
    node_b.shutdown().await.unwrap();
}

/// Test: jobs submitted through one node run on another.
#[tokio::test]
async fn test_submission_visible_to_other_nodes() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let on_b = Arc::new(RecordingExecutor::new());
    let (node_a, _) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-a",
        vec![Registration::new("WORK", Arc::new(RecordingExecutor::new()))],
    )
    .await;
    let (node_b, watcher_b) = start_node(
        Arc::clone(&storage),
        &clock,
        "node-b",
        vec![Registration::new("WORK", on_b.clone())],
    )
    .await;

    let job = node_a
        .schedule_job(
            "WORK",
            "remote",
            BTreeMap::new(),
            Trigger::single_at(slice(1).start(), WIDTH),
        )
        .await
        .unwrap();

    clock.set(slice(1).start());
    node_b.tick().await.unwrap();
    assert!(watcher_b.wait_for_slice(slice(1), WAIT).await);

    assert_eq!(on_b.job_ids(), vec![job.job_id]);
    assert_eq!(node_a.active_queue().await.unwrap(), Some(slice(2)));

    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}
