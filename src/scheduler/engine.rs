//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Walking due time slices and taking each slice's advance lock
//! - Dispatching the jobs indexed under a slice to their executors
//! - Rescheduling retries and recurrences into later slices
//! - Advancing the active queue pointer once a slice is drained
//! - Pause, resume and graceful shutdown
//! - Event emission
//!
//! Several nodes can run the same engine against shared storage. Only the
//! holder of a slice's advance lock dispatches that slice, and the pointer
//! only moves past slices whose jobs have all reached a terminal state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::core::clock::{Clock, SystemClock};
use crate::core::executor::{JobError, JobExecutor};
use crate::core::job::{JobDetails, SubmissionError};
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::core::trigger::Trigger;
use crate::core::types::{DEFAULT_SLICE_WIDTH, JobId, NodeId, TimeSlice};
use crate::events::{Event, EventBus};
use crate::lock::{LockManager, LockOutcome};
use crate::storage::{Storage, StorageError};

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::registry::{JobRegistration, JobRegistry};
use super::types::{SchedulerCommand, SchedulerError, SchedulerState, TickReport};

/// Prefix of the per-slice advance lock names.
const ADVANCE_LOCK_PREFIX: &str = "slicer.advance";

/// Name of the cluster-wide lock guarding `slice`.
pub fn advance_lock_name(slice: TimeSlice) -> String {
    format!("{}.{}", ADVANCE_LOCK_PREFIX, slice.timestamp_millis())
}

/// Local progress of a slice this node holds the advance lock for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SliceProgress {
    /// Jobs dispatched, awaiting completions.
    Draining,
    /// Every dispatched job finished; waiting to advance in order.
    Drained,
}

/// Main scheduler for time-sliced job execution.
pub struct Scheduler<S: Storage> {
    /// Storage backend.
    storage: Arc<S>,
    /// Executors by job type.
    registry: Arc<JobRegistry>,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Owner value used for locks.
    node_id: NodeId,
    /// Width of a time slice.
    slice_width: Duration,
    /// Period of the internal clock (defaults to the slice width).
    tick_interval: Option<Duration>,
    /// Only tick when asked through the handle.
    manual_ticks: bool,
    /// Maximum executors running at once on this node.
    max_concurrent_jobs: usize,
    /// Maximum slices walked per tick when catching up.
    max_catch_up_slices: usize,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
}

impl<S: Storage + 'static> Scheduler<S> {
    /// Create a new scheduler with the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new scheduler with shared storage.
    ///
    /// Schedulers sharing one storage behave as nodes of one cluster.
    pub fn with_storage(storage: Arc<S>) -> Self {
        Self {
            storage,
            registry: Arc::new(JobRegistry::new()),
            event_bus: Arc::new(EventBus::new()),
            clock: Arc::new(SystemClock),
            node_id: NodeId::random(),
            slice_width: DEFAULT_SLICE_WIDTH,
            tick_interval: None,
            manual_ticks: false,
            max_concurrent_jobs: 16,
            max_catch_up_slices: 60,
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the node identity used as lock owner.
    pub fn with_node_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the slice width.
    pub fn with_slice_width(mut self, width: Duration) -> Self {
        self.slice_width = width;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    /// Disable the internal clock; ticks only happen through `SchedulerHandle::tick`.
    pub fn with_manual_ticks(mut self) -> Self {
        self.manual_ticks = true;
        self
    }

    /// Set the maximum concurrent jobs.
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Set how many slices one tick may walk.
    pub fn with_max_catch_up_slices(mut self, max: usize) -> Self {
        self.max_catch_up_slices = max.max(1);
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Register an executor for a job type.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        executor: Arc<dyn JobExecutor>,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
    ) {
        self.registry.register(job_type, executor, retry_policy);
    }

    /// Get the executor registry.
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Get the node identity.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Start the scheduler and return a handle for controlling it.
    pub async fn start(self) -> (SchedulerHandle<S>, JoinHandle<()>) {
        let tick_interval = self.tick_interval.unwrap_or(self.slice_width);
        let manual_ticks = self.manual_ticks;
        let shutdown_timeout = self.shutdown_timeout;

        let core = Arc::new(SchedulerCore {
            locks: LockManager::new(Arc::clone(&self.storage)),
            storage: self.storage,
            registry: self.registry,
            event_bus: self.event_bus,
            clock: self.clock,
            node_id: self.node_id,
            slice_width: self.slice_width,
            max_catch_up_slices: self.max_catch_up_slices,
            permits: Arc::new(Semaphore::new(self.max_concurrent_jobs)),
            slices: Mutex::new(BTreeMap::new()),
            advance_guard: tokio::sync::Mutex::new(()),
            running_drains: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        });

        core.ensure_active_queue().await;
        tracing::info!(
            node_id = %core.node_id,
            slice_width = ?core.slice_width,
            consistency = %core.storage.consistency(),
            "Scheduler started"
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
            core: Arc::clone(&core),
        };

        let scheduler_task = tokio::spawn(async move {
            let interval = (!manual_ticks).then_some(tick_interval);
            run(core, command_rx, state, interval, shutdown_timeout).await;
        });

        (handle, scheduler_task)
    }
}

/// Main scheduler loop.
async fn run<S: Storage + 'static>(
    core: Arc<SchedulerCore<S>>,
    mut command_rx: mpsc::Receiver<SchedulerCommand>,
    state: Arc<RwLock<SchedulerState>>,
    tick_interval: Option<Duration>,
    shutdown_timeout: Duration,
) {
    let mut interval = tick_interval.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = next_tick(&mut interval) => {
                let dispatch = *state.read().await == SchedulerState::Running;
                if let Err(e) = core.tick(dispatch).await {
                    tracing::warn!(node_id = %core.node_id, error = %e, "Tick failed, retrying on the next one");
                }

                // Clean up finished drain handles
                core.cleanup_finished_drains();
            }

            command = command_rx.recv() => {
                let Some(command) = command else {
                    tracing::info!("All scheduler handles dropped, stopping");
                    core.stop(shutdown_timeout).await;
                    break;
                };
                match command {
                    SchedulerCommand::Tick { response } => {
                        let dispatch = *state.read().await == SchedulerState::Running;
                        let result = core.tick(dispatch).await;
                        let _ = response.send(result);
                    }
                    SchedulerCommand::Pause { response } => {
                        let mut s = state.write().await;
                        *s = SchedulerState::Paused;
                        tracing::info!("Scheduler paused, in-flight jobs keep running");
                        let _ = response.send(());
                    }
                    SchedulerCommand::Resume { response } => {
                        let mut s = state.write().await;
                        *s = SchedulerState::Running;
                        tracing::info!("Scheduler resumed");
                        let _ = response.send(());
                    }
                    SchedulerCommand::Shutdown { response } => {
                        let mut s = state.write().await;
                        *s = SchedulerState::Stopped;
                        drop(s); // Release the lock before waiting

                        core.stop(shutdown_timeout).await;

                        let _ = response.send(());
                        break;
                    }
                }
            }
        }
    }
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn panic_message(error: JoinError) -> String {
    if error.is_cancelled() {
        return "executor task was cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// State shared by the scheduler loop, the drain tasks and the handles.
pub(crate) struct SchedulerCore<S: Storage> {
    pub(crate) storage: Arc<S>,
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) locks: LockManager<S>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) node_id: NodeId,
    pub(crate) slice_width: Duration,
    max_catch_up_slices: usize,
    permits: Arc<Semaphore>,
    /// Slices this node holds the advance lock for.
    slices: Mutex<BTreeMap<TimeSlice, SliceProgress>>,
    /// Serializes pointer advancement on this node.
    advance_guard: tokio::sync::Mutex<()>,
    running_drains: Mutex<HashMap<TimeSlice, JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<S: Storage + 'static> SchedulerCore<S> {
    fn current_slice(&self) -> TimeSlice {
        TimeSlice::containing(self.clock.now(), self.slice_width)
    }

    fn progress(&self, slice: TimeSlice) -> Option<SliceProgress> {
        let slices = self.slices.lock().unwrap_or_else(|e| e.into_inner());
        slices.get(&slice).copied()
    }

    fn set_progress(&self, slice: TimeSlice, progress: SliceProgress) {
        let mut slices = self.slices.lock().unwrap_or_else(|e| e.into_inner());
        slices.insert(slice, progress);
    }

    fn forget_slice(&self, slice: TimeSlice) {
        let mut slices = self.slices.lock().unwrap_or_else(|e| e.into_inner());
        slices.remove(&slice);
    }

    /// Initialise the active queue pointer to the current slice if absent.
    async fn ensure_active_queue(&self) -> Option<TimeSlice> {
        match self.storage.get_active_queue().await {
            Ok(Some(pointer)) => return Some(pointer),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read active queue");
                return None;
            }
        }

        let current = self.current_slice();
        match self.storage.init_active_queue(current).await {
            Ok(true) => {
                tracing::info!(time_slice = %current, "Initialised active queue");
                Some(current)
            }
            Ok(false) => self.storage.get_active_queue().await.ok().flatten(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to initialise active queue");
                None
            }
        }
    }

    /// Read the active queue pointer.
    pub(crate) async fn active_queue(&self) -> Result<Option<TimeSlice>, StorageError> {
        self.storage.get_active_queue().await
    }

    /// Run one tick.
    ///
    /// Walks every due slice from the active queue pointer up to the
    /// current slice, taking the advance lock of each slice not already held
    /// by this node. When `dispatch` is false only advancement happens.
    pub(crate) async fn tick(self: &Arc<Self>, dispatch: bool) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport::default();
        report.advanced = self.try_advance(true).await;

        let pointer = match self.storage.get_active_queue().await? {
            Some(pointer) => pointer,
            None => match self.ensure_active_queue().await {
                Some(pointer) => pointer,
                None => return Err(SchedulerError::Storage(StorageError::Other(
                    "active queue is not initialised".to_string(),
                ))),
            },
        };
        report.active_queue = Some(pointer);
        self.release_stale_slices(pointer).await;

        if !dispatch {
            return Ok(report);
        }

        let current = self.current_slice();
        let mut slice = pointer;
        let mut walked = 0;
        while slice <= current && walked < self.max_catch_up_slices {
            if self.progress(slice).is_none() {
                match self
                    .locks
                    .acquire_exclusive_lock(&advance_lock_name(slice), self.node_id.as_str())
                    .await
                {
                    LockOutcome::Acquired => {
                        self.spawn_drain(slice);
                        report.dispatched.push(slice);
                    }
                    LockOutcome::Contended => {
                        tracing::debug!(time_slice = %slice, node_id = %self.node_id, "Slice is owned by another node, deferring");
                        self.event_bus.emit(Event::tick_deferred(slice)).await;
                        report.deferred.push(slice);
                    }
                    LockOutcome::StorageError(e) => {
                        tracing::warn!(time_slice = %slice, error = %e, "Could not take advance lock, deferring");
                        report.deferred.push(slice);
                    }
                }
            }
            slice = slice.next(self.slice_width);
            walked += 1;
        }

        if slice <= current {
            tracing::info!(
                active_queue = %pointer,
                current = %current,
                "Catching up, {} slice(s) walked this tick",
                walked
            );
        }

        Ok(report)
    }

    fn spawn_drain(self: &Arc<Self>, slice: TimeSlice) {
        self.set_progress(slice, SliceProgress::Draining);
        let core = Arc::clone(self);
        let handle = tokio::spawn(async move {
            core.drain(slice).await;
        });
        let mut running = self.running_drains.lock().unwrap_or_else(|e| e.into_inner());
        running.insert(slice, handle);
    }

    /// Dispatch every pending job of `slice` and wait for all of them.
    async fn drain(self: Arc<Self>, slice: TimeSlice) {
        match self.storage.get_slice_status(slice).await {
            Ok(status) => {
                let pending = status.pending();
                tracing::debug!(time_slice = %slice, jobs = pending.len(), "Draining slice");

                let mut tasks = JoinSet::new();
                for job_id in pending {
                    let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                        break;
                    };
                    let core = Arc::clone(&self);
                    tasks.spawn(async move {
                        let _permit = permit;
                        core.run_job(slice, job_id).await;
                    });
                }

                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        tracing::warn!(time_slice = %slice, error = %e, "Job task ended abnormally");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(time_slice = %slice, error = %e, "Failed to load slice, retrying on the next tick");
            }
        }

        self.set_progress(slice, SliceProgress::Drained);
        self.try_advance(false).await;
    }

    /// Run one job and record its outcome for `slice`.
    async fn run_job(&self, slice: TimeSlice, job_id: JobId) {
        let job = match self.storage.get_job(&job_id).await {
            Ok(job) => job,
            Err(StorageError::NotFound(_)) => {
                tracing::debug!(job_id = %job_id, time_slice = %slice, "Job row is gone, treating as removed");
                self.mark_finished(slice, &job_id).await;
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, time_slice = %slice, error = %e, "Failed to load job, retrying on the next tick");
                return;
            }
        };

        // Already moved on by an interrupted reschedule; its new slice runs it.
        let due = job.time_slice(self.slice_width);
        if due != slice {
            tracing::debug!(job_id = %job_id, time_slice = %slice, due = %due, "Job belongs to another slice, skipping");
            self.mark_finished(slice, &job_id).await;
            return;
        }

        let Some(JobRegistration {
            executor,
            retry_policy,
        }) = self.registry.get(&job.job_type)
        else {
            tracing::warn!(
                job_id = %job_id,
                job_type = %job.job_type,
                time_slice = %slice,
                "No executor registered for job type, dead-lettering"
            );
            self.mark_finished(slice, &job_id).await;
            self.event_bus
                .emit(Event::job_dead_lettered(job_id, job.job_type.clone(), slice))
                .await;
            return;
        };

        if let Err(e) = self.storage.add_active(slice, &job_id).await {
            tracing::warn!(job_id = %job_id, time_slice = %slice, error = %e, "Failed to mark job active, retrying on the next tick");
            return;
        }

        self.event_bus
            .emit(Event::job_started(job_id, job.job_type.clone(), slice))
            .await;
        tracing::info!(job_id = %job_id, job_type = %job.job_type, time_slice = %slice, "Executing {}", job);

        let start = Instant::now();
        let task_job = job.clone();
        let result = match tokio::spawn(async move { executor.execute(&task_job).await }).await {
            Ok(result) => result,
            Err(e) => Err(JobError::Panicked(panic_message(e))),
        };

        match result {
            Ok(()) => {
                tracing::info!(job_id = %job_id, duration = ?start.elapsed(), "Finished executing {}", job);
                self.event_bus
                    .emit(Event::job_completed(
                        job_id,
                        job.job_type.clone(),
                        slice,
                        start.elapsed(),
                    ))
                    .await;
                self.complete(slice, job).await;
            }
            Err(error) => self.fail(slice, job, error, retry_policy.as_ref()).await,
        }
    }

    /// Re-arm a recurring job or retire the row.
    async fn complete(&self, slice: TimeSlice, job: JobDetails) {
        match job.trigger.next_trigger(self.clock.now(), self.slice_width) {
            Some(next) => self.reschedule(slice, job.rescheduled(next, 0)).await,
            None => self.retire(slice, &job.job_id).await,
        }
    }

    async fn fail(
        &self,
        slice: TimeSlice,
        job: JobDetails,
        error: JobError,
        policy: &dyn RetryPolicy,
    ) {
        match policy.decide(&job, &error) {
            RetryDecision::RetryAfter(delay) => {
                let now = self.clock.now();
                let earliest = TimeSlice::containing(now, self.slice_width).next(self.slice_width);
                let mut trigger = Trigger::single_after(now, delay, self.slice_width);
                if trigger.time_slice(self.slice_width) < earliest {
                    trigger = Trigger::SingleExecution {
                        trigger_time: earliest.start(),
                    };
                }
                let retry_at = trigger.trigger_time();

                tracing::warn!(
                    job_id = %job.job_id,
                    job_type = %job.job_type,
                    time_slice = %slice,
                    retry_at = %retry_at,
                    error = %error,
                    "Job failed, retrying"
                );
                self.event_bus
                    .emit(Event::job_failed(
                        job.job_id,
                        job.job_type.clone(),
                        slice,
                        error.to_string(),
                        Some(retry_at),
                    ))
                    .await;

                let retry_count = job.retry_count.saturating_add(1);
                self.reschedule(slice, job.rescheduled(trigger, retry_count))
                    .await;
            }
            RetryDecision::Terminal => {
                tracing::error!(
                    job_id = %job.job_id,
                    job_type = %job.job_type,
                    time_slice = %slice,
                    retries = job.retry_count,
                    error = %error,
                    "Job failed permanently"
                );
                self.event_bus
                    .emit(Event::job_failed(
                        job.job_id,
                        job.job_type.clone(),
                        slice,
                        error.to_string(),
                        None,
                    ))
                    .await;

                // A failed occurrence of a repeating job does not end the series.
                self.complete(slice, job).await;
            }
        }
    }

    /// Move `job` from `slice` to the slice of its new trigger.
    async fn reschedule(&self, slice: TimeSlice, job: JobDetails) {
        let to = job.time_slice(self.slice_width);
        let job_id = job.job_id;
        let retry_count = job.retry_count;

        let result = async {
            self.storage.update_job(job).await?;
            self.storage.add_scheduled(to, &job_id).await?;
            self.storage.add_finished(slice, &job_id).await?;
            self.storage.remove_scheduled(slice, &job_id).await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(job_id = %job_id, from = %slice, to = %to, "Rescheduled job");
                self.event_bus
                    .emit(Event::job_rescheduled(job_id, slice, to, retry_count))
                    .await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, time_slice = %slice, error = %e, "Failed to reschedule job, retrying on the next tick");
            }
        }
    }

    /// Mark `job_id` finished for `slice` and delete its row.
    async fn retire(&self, slice: TimeSlice, job_id: &JobId) {
        if !self.mark_finished(slice, job_id).await {
            return;
        }
        match self.storage.delete_job(job_id).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to delete finished job");
            }
        }
    }

    async fn mark_finished(&self, slice: TimeSlice, job_id: &JobId) -> bool {
        match self.storage.add_finished(slice, job_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(job_id = %job_id, time_slice = %slice, error = %e, "Failed to mark job finished, retrying on the next tick");
                false
            }
        }
    }

    /// Advance the active queue past every drained slice at its head.
    ///
    /// Returns the slices advanced past, in order. Leftover jobs found in a
    /// drained slice are re-dispatched when called from a tick.
    async fn try_advance(self: &Arc<Self>, from_tick: bool) -> Vec<TimeSlice> {
        let _guard = self.advance_guard.lock().await;
        let mut advanced = Vec::new();

        while !self.stopped.load(Ordering::SeqCst) {
            let pointer = match self.storage.get_active_queue().await {
                Ok(Some(pointer)) => pointer,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read active queue");
                    break;
                }
            };

            if self.progress(pointer) != Some(SliceProgress::Drained) {
                break;
            }

            let pending = match self.storage.get_slice_status(pointer).await {
                Ok(status) => status.pending(),
                Err(e) => {
                    tracing::warn!(time_slice = %pointer, error = %e, "Failed to re-check slice before advancing");
                    break;
                }
            };

            if !pending.is_empty() {
                if from_tick {
                    tracing::info!(time_slice = %pointer, jobs = pending.len(), "Re-dispatching leftover jobs");
                    self.spawn_drain(pointer);
                } else {
                    tracing::debug!(time_slice = %pointer, jobs = pending.len(), "Slice has leftover jobs, waiting for the next tick");
                }
                break;
            }

            if let Err(e) = self.storage.delete_slice(pointer).await {
                tracing::warn!(time_slice = %pointer, error = %e, "Failed to clear slice index");
                break;
            }

            let next = pointer.next(self.slice_width);
            let moved = match self.storage.advance_active_queue(pointer, next).await {
                Ok(moved) => moved,
                Err(e) => {
                    tracing::warn!(time_slice = %pointer, error = %e, "Failed to advance active queue");
                    break;
                }
            };

            let lock = advance_lock_name(pointer);
            if let Err(e) = self
                .locks
                .release_exclusive_lock(&lock, self.node_id.as_str())
                .await
            {
                tracing::warn!(lock = %lock, error = %e, "Failed to release advance lock");
            }
            self.forget_slice(pointer);

            if moved {
                tracing::info!(time_slice = %pointer, next = %next, "Time slice finished");
                self.event_bus.emit(Event::time_slice_finished(pointer)).await;
                advanced.push(pointer);
            } else {
                tracing::debug!(time_slice = %pointer, "Active queue already moved, nothing to advance");
            }
        }

        advanced
    }

    /// Release drained slices the active queue already moved past.
    ///
    /// A node can take a slice's lock just as another node advances past it;
    /// such a slice drains to nothing and must not keep its lock.
    async fn release_stale_slices(&self, pointer: TimeSlice) {
        let stale: Vec<TimeSlice> = {
            let slices = self.slices.lock().unwrap_or_else(|e| e.into_inner());
            slices
                .iter()
                .filter(|(slice, progress)| **slice < pointer && **progress == SliceProgress::Drained)
                .map(|(slice, _)| *slice)
                .collect()
        };

        for slice in stale {
            let lock = advance_lock_name(slice);
            if let Err(e) = self
                .locks
                .release_exclusive_lock(&lock, self.node_id.as_str())
                .await
            {
                tracing::warn!(lock = %lock, error = %e, "Failed to release stale advance lock");
            }
            self.forget_slice(slice);
            tracing::debug!(time_slice = %slice, active_queue = %pointer, "Released slice behind the active queue");
        }
    }

    /// Clean up finished drain handles.
    fn cleanup_finished_drains(&self) {
        let mut running = self.running_drains.lock().unwrap_or_else(|e| e.into_inner());
        running.retain(|_, handle| !handle.is_finished());
    }

    fn running_drain_count(&self) -> usize {
        let mut running = self.running_drains.lock().unwrap_or_else(|e| e.into_inner());
        running.retain(|_, handle| !handle.is_finished());
        running.len()
    }

    /// Wait for in-flight drains, then release every lock this node holds.
    async fn stop(&self, shutdown_timeout: Duration) {
        self.await_running_drains(shutdown_timeout).await;
        self.stopped.store(true, Ordering::SeqCst);

        let _guard = self.advance_guard.lock().await;
        let released = self.locks.release_all().await;
        tracing::info!(node_id = %self.node_id, released, "Scheduler stopped, locks released");
    }

    /// Wait for all running drains to complete with a timeout.
    async fn await_running_drains(&self, shutdown_timeout: Duration) {
        let running_count = self.running_drain_count();

        if running_count == 0 {
            tracing::info!("No running slices to wait for during shutdown");
            return;
        }

        tracing::info!(
            "Graceful shutdown: waiting for {} slice(s) to drain (timeout: {:?})",
            running_count,
            shutdown_timeout
        );

        let start = tokio::time::Instant::now();
        let deadline = start + shutdown_timeout;

        loop {
            // Check if all drains are done
            let remaining = self.running_drain_count();

            if remaining == 0 {
                let elapsed = start.elapsed();
                tracing::info!("All running slices drained gracefully in {:?}", elapsed);
                break;
            }

            // Check if we've exceeded the timeout
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "Graceful shutdown timeout ({:?}) exceeded with {} slice(s) still draining, abandoning them",
                    shutdown_timeout,
                    remaining
                );
                break;
            }

            // Wait a bit before checking again
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Validate and persist a new job.
    pub(crate) async fn submit(&self, job: JobDetails) -> Result<JobDetails, SchedulerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }
        job.validate(self.slice_width)?;

        let Some(registration) = self.registry.get(&job.job_type) else {
            return Err(SubmissionError::UnknownJobType(job.job_type.clone()).into());
        };
        registration
            .executor
            .validate_parameters(&job)
            .map_err(SubmissionError::from)?;

        let time_slice = job.time_slice(self.slice_width);
        let active_slice = match self.storage.get_active_queue().await? {
            Some(pointer) => pointer,
            None => self.current_slice(),
        };
        if time_slice < active_slice {
            return Err(SubmissionError::SliceAlreadyProcessed {
                trigger_slice: time_slice,
                active_slice,
            }
            .into());
        }

        let status = self.storage.get_slice_status(time_slice).await?;
        for id in &status.scheduled {
            let existing = match self.storage.get_job(id).await {
                Ok(existing) => existing,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if existing.job_type == job.job_type && existing.job_name == job.job_name {
                return Err(SubmissionError::DuplicateJobName {
                    job_type: job.job_type.clone(),
                    job_name: job.job_name.clone(),
                    time_slice,
                }
                .into());
            }
        }

        self.storage.insert_job(job.clone()).await?;
        self.storage.add_scheduled(time_slice, &job.job_id).await?;

        tracing::info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            time_slice = %time_slice,
            "Scheduled {}",
            job
        );
        Ok(job)
    }
}
