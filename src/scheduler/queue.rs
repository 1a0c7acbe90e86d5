//! Queue manager: owns the global schedule.
//!
//! Decides which job goes to which worker, when, and what happens after each
//! outcome. All queue collections live behind a single mutex that is never
//! held across an await, so bookkeeping is serialized exactly as it was in
//! the original single-threaded event loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::llm::TextGenerator;

use super::job::{Job, JobPriority, JobSpec, JobStatus, OutcomeKind};
use super::log_router::JobLogRouter;
use super::worker::{Worker, WorkerConfig, WorkerEvent, WorkerInfo, WorkerState};

/// Configuration for the queue manager.
///
/// Defaults match the reference behavior; the distinct-worker ceiling and
/// every interval are tunable.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Period of the recurring scheduling tick.
    pub tick_interval: Duration,
    /// Maximum number of distinct workers that may try one job before it is
    /// finalized as failed.
    pub max_unique_worker_attempts: usize,
    /// Polling period used by [`QueueManager::await_job`].
    pub wait_poll_interval: Duration,
    /// Default wait budget for [`QueueManager::await_job`].
    pub wait_timeout: Duration,
    /// Retry and cooldown policy applied to every worker in the pool.
    pub worker: WorkerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            max_unique_worker_attempts: 3,
            wait_poll_interval: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(300),
            worker: WorkerConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Sets the scheduling tick period.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the distinct-worker ceiling.
    pub fn with_max_unique_worker_attempts(mut self, attempts: usize) -> Self {
        self.max_unique_worker_attempts = attempts.max(1);
        self
    }

    /// Sets the waiter polling period.
    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    /// Sets the default wait budget.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Sets the per-worker retry and cooldown policy.
    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    /// Jobs ever submitted.
    pub total_jobs: u64,
    /// Jobs finalized as completed.
    pub completed: u64,
    /// Jobs finalized as failed.
    pub failed: u64,
    /// Jobs currently waiting in the pending queue.
    pub in_queue: usize,
    /// Jobs currently executing.
    pub processing: usize,
}

/// Condensed view of a queued job, for status previews.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub title: String,
    pub status: JobStatus,
}

/// Snapshot of the whole queue, safe to hand to UI code.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub is_running: bool,
    pub workers: Vec<WorkerInfo>,
    pub queue: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub stats: QueueStats,
    /// The next few queued jobs, in scheduling order.
    pub next_jobs: Vec<JobSummary>,
}

/// Terminal job notification.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The job completed; `job.result` holds the generated text.
    Completed { job: Job },
    /// The job was finalized as failed; `job.error` holds the reason.
    Failed { job: Job },
}

/// Cross-worker attempt tracking for one in-flight-or-pending job.
/// Deleted once the job reaches a terminal state.
#[derive(Debug, Default)]
struct JobTracking {
    workers_attempted: HashSet<String>,
    total_failures: u32,
    last_error: Option<String>,
}

/// All queue collections. A job id appears in exactly one of
/// `pending`, `in_flight`, `completed`, `failed` at any time.
#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    in_flight: HashMap<Uuid, Job>,
    completed: Vec<Job>,
    failed: Vec<Job>,
    tracking: HashMap<Uuid, JobTracking>,
    stats: QueueStats,
}

impl QueueState {
    fn refresh_counts(&mut self) {
        self.stats.in_queue = self.pending.len();
        self.stats.processing = self.in_flight.len();
    }
}

/// The scheduler. Construct once, share via `Arc`.
pub struct QueueManager {
    config: QueueConfig,
    generator: Arc<dyn TextGenerator>,
    state: Mutex<QueueState>,
    workers: RwLock<Vec<Arc<Worker>>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    worker_events: broadcast::Sender<WorkerEvent>,
    job_events: broadcast::Sender<JobEvent>,
    log_router: Arc<JobLogRouter>,
    kick: Notify,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    /// Creates a queue manager with default configuration.
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self::with_config(generator, QueueConfig::default())
    }

    /// Creates a queue manager with the given configuration.
    pub fn with_config(generator: Arc<dyn TextGenerator>, config: QueueConfig) -> Self {
        let (worker_events, _) = broadcast::channel(256);
        let (job_events, _) = broadcast::channel(256);

        Self {
            config,
            generator,
            state: Mutex::new(QueueState::default()),
            workers: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            worker_events,
            job_events,
            log_router: Arc::new(JobLogRouter::new()),
            kick: Notify::new(),
            tick_task: Mutex::new(None),
            router_task: Mutex::new(None),
        }
    }

    /// Returns the manager's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Discards any existing worker pool and creates one worker per
    /// credential. Blank credentials are skipped.
    pub fn initialize_workers(&self, credentials: Vec<String>) {
        let mut pool = Vec::new();
        for (index, credential) in credentials.iter().enumerate() {
            let credential = credential.trim();
            if credential.is_empty() {
                continue;
            }
            pool.push(Arc::new(Worker::new(
                format!("worker-{}", index + 1),
                credential,
                self.config.worker.clone(),
                Arc::clone(&self.generator),
                self.worker_events.clone(),
            )));
        }

        info!(workers = pool.len(), "Initialized worker pool");
        *self.workers.write() = pool;
    }

    /// Enqueues a batch of jobs and returns their assigned ids, in order.
    pub fn add_jobs(&self, specs: Vec<JobSpec>) -> Vec<Uuid> {
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(specs.len());

        for spec in specs {
            let job = Job::from_spec(spec);
            debug!(job_id = %job.id, title = %job.title, "Job enqueued");
            ids.push(job.id);
            state.pending.push_back(job);
        }

        state.stats.total_jobs += ids.len() as u64;
        state.refresh_counts();
        ids
    }

    /// Begins the recurring scheduling tick.
    ///
    /// Idempotent: calling while already running logs a warning and returns
    /// `Ok`. Fails with [`QueueError::NoWorkers`] when the pool is empty.
    pub fn start(self: &Arc<Self>) -> Result<(), QueueError> {
        if self.workers.read().is_empty() {
            return Err(QueueError::NoWorkers);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Queue manager is already running");
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        // Pump worker events into the per-job log router.
        let router = Arc::clone(&self.log_router);
        let mut events = self.worker_events.subscribe();
        let pump_token = token.clone();
        *self.router_task.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => router.dispatch(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Log router lagged behind worker events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }));

        // Scheduling tick: periodic, plus an immediate pass, plus kicks from
        // outcome handling.
        let manager = Arc::clone(self);
        *self.tick_task.lock() = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = manager.kick.notified() => {}
                }
                manager.schedule();
            }
        }));

        info!(workers = self.workers.read().len(), "Queue manager started");
        Ok(())
    }

    /// One scheduling pass: assign each eligible worker the first compatible
    /// queued job, then launch the executions.
    fn schedule(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }

        let eligible: Vec<Arc<Worker>> = self
            .workers
            .read()
            .iter()
            .filter(|worker| worker.is_ready_for_work())
            .cloned()
            .collect();

        let mut assignments: Vec<(Job, Arc<Worker>)> = Vec::new();
        {
            let mut state = self.state.lock();
            if eligible.is_empty() || state.pending.is_empty() {
                if eligible.is_empty() && !state.pending.is_empty() {
                    debug!(
                        queued = state.pending.len(),
                        "Jobs waiting for an eligible worker"
                    );
                }
                return;
            }

            // Priority view: high before normal, stable within each class.
            let mut order: Vec<Uuid> = Vec::with_capacity(state.pending.len());
            order.extend(
                state
                    .pending
                    .iter()
                    .filter(|j| j.priority == JobPriority::High)
                    .map(|j| j.id),
            );
            order.extend(
                state
                    .pending
                    .iter()
                    .filter(|j| j.priority != JobPriority::High)
                    .map(|j| j.id),
            );

            let mut claimed: HashSet<Uuid> = HashSet::new();
            for worker in &eligible {
                let pick = order.iter().copied().find(|id| {
                    if claimed.contains(id) {
                        return false;
                    }
                    state
                        .pending
                        .iter()
                        .find(|j| j.id == *id)
                        .is_some_and(|j| !j.excluded_workers.contains(worker.id()))
                });
                let Some(job_id) = pick else {
                    continue;
                };

                claimed.insert(job_id);
                let Some(position) = state.pending.iter().position(|j| j.id == job_id) else {
                    continue;
                };
                let Some(mut job) = state.pending.remove(position) else {
                    continue;
                };

                job.mark_assigned(worker.id());
                // Reserve synchronously so a rapid follow-up tick cannot
                // double-book this worker before the task starts.
                worker.reserve();
                debug!(
                    job_id = %job.id,
                    worker_id = %worker.id(),
                    "Job assigned"
                );
                state.in_flight.insert(job.id, job.clone());
                assignments.push((job, Arc::clone(worker)));
            }
            state.refresh_counts();
        }

        let cancel = self.cancel.lock().clone();
        for (job, worker) in assignments {
            let manager = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager.run_job(job, worker, cancel).await;
            });
        }
    }

    /// Drives one assigned execution to its outcome and applies the
    /// queue-level consequences.
    async fn run_job(
        self: Arc<Self>,
        job: Job,
        worker: Arc<Worker>,
        cancel: CancellationToken,
    ) {
        // Worker panics are bugs, not domain failures; convert them into a
        // re-queue instead of losing the job.
        let executed = AssertUnwindSafe(worker.execute(&job, &cancel))
            .catch_unwind()
            .await;

        {
            let mut state = self.state.lock();
            let Some(mut job) = state.in_flight.remove(&job.id) else {
                warn!(job_id = %job.id, "Outcome for a job no longer in flight");
                return;
            };

            match executed {
                Ok(outcome) => match outcome.kind {
                    OutcomeKind::Success(text) => {
                        job.mark_completed(text, outcome.attempts, &outcome.worker_id);
                        state.stats.completed += 1;
                        state.tracking.remove(&job.id);
                        info!(
                            job_id = %job.id,
                            worker_id = %outcome.worker_id,
                            attempts = outcome.attempts,
                            "Job completed"
                        );
                        state.completed.push(job.clone());
                        let _ = self.job_events.send(JobEvent::Completed { job });
                    }
                    OutcomeKind::Failure { error, requeue: true } => {
                        let distinct = {
                            let tracking = state.tracking.entry(job.id).or_default();
                            tracking.workers_attempted.insert(worker.id().to_string());
                            tracking.total_failures += 1;
                            tracking.last_error = Some(error.clone());
                            tracking.workers_attempted.len()
                        };

                        if distinct < self.config.max_unique_worker_attempts {
                            info!(
                                job_id = %job.id,
                                worker_id = %worker.id(),
                                distinct_workers = distinct,
                                ceiling = self.config.max_unique_worker_attempts,
                                "Job failed on worker; requeueing for another"
                            );
                            job.mark_requeued(worker.id());
                            state.pending.push_front(job);
                        } else {
                            let message = format!(
                                "Failed after attempts on {} workers: {}",
                                distinct, error
                            );
                            self.finalize_failed(&mut state, job, message);
                        }
                    }
                    OutcomeKind::Failure { error, requeue: false } => {
                        self.finalize_failed(&mut state, job, error);
                    }
                    OutcomeKind::Cancelled => {
                        debug!(
                            job_id = %job.id,
                            "Execution cancelled; returning job to queue unpenalized"
                        );
                        job.mark_interrupted();
                        state.pending.push_front(job);
                    }
                },
                Err(_) => {
                    error!(
                        job_id = %job.id,
                        worker_id = %worker.id(),
                        "Execution panicked; requeueing job"
                    );
                    let tracking = state.tracking.entry(job.id).or_default();
                    tracking.workers_attempted.insert(worker.id().to_string());
                    tracking.total_failures += 1;
                    job.mark_requeued(worker.id());
                    state.pending.push_front(job);
                }
            }

            state.refresh_counts();
        }

        // Freed workers should pick up new work without waiting for the
        // next periodic tick.
        self.kick.notify_one();
    }

    fn finalize_failed(&self, state: &mut QueueState, mut job: Job, message: String) {
        error!(job_id = %job.id, error = %message, "Job failed permanently");
        job.mark_failed(message);
        state.stats.failed += 1;
        state.tracking.remove(&job.id);
        state.failed.push(job.clone());
        let _ = self.job_events.send(JobEvent::Failed { job });
    }

    /// Halts the tick, aborts in-flight execution via the shared cancellation
    /// token, and stops every worker. Queue, completed and failed state are
    /// preserved; only [`QueueManager::clear`] resets them.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping queue manager");

        self.cancel.lock().cancel();
        if let Some(handle) = self.tick_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.router_task.lock().take() {
            handle.abort();
        }
        for worker in self.workers.read().iter() {
            worker.stop();
        }
    }

    /// Stops everything and resets all collections and stats to empty.
    pub fn clear(&self) {
        self.stop();
        let mut state = self.state.lock();
        *state = QueueState::default();
        info!("Queue cleared");
    }

    /// Moves every failed job back into the pending queue for a completely
    /// fresh set of attempts, clearing attempt counts, error state and the
    /// exclusion history.
    pub fn retry_failed_jobs(&self) {
        let mut state = self.state.lock();
        if state.failed.is_empty() {
            return;
        }

        let failed: Vec<Job> = state.failed.drain(..).collect();
        let count = failed.len();
        for mut job in failed {
            job.reset_for_retry();
            state.pending.push_back(job);
        }
        state.stats.failed = 0;
        state.refresh_counts();

        info!(count, "Retrying failed jobs");
    }

    /// Restarts workers that are disabled or in cooldown.
    pub fn restart_workers(&self) {
        for worker in self.workers.read().iter() {
            if matches!(worker.state(), WorkerState::Disabled | WorkerState::Cooldown) {
                worker.restart();
            }
        }
        info!("Workers restarted");
    }

    /// Whether the scheduling tick is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the whole queue.
    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock();
        QueueStatus {
            is_running: self.is_running(),
            workers: self.workers.read().iter().map(|w| w.info()).collect(),
            queue: state.pending.len(),
            processing: state.in_flight.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            stats: state.stats,
            next_jobs: state
                .pending
                .iter()
                .take(5)
                .map(|job| JobSummary {
                    id: job.id,
                    title: job.title.clone(),
                    status: job.status,
                })
                .collect(),
        }
    }

    /// Looks a job up by id across every collection.
    pub fn get_job(&self, job_id: Uuid) -> Option<Job> {
        let state = self.state.lock();
        state
            .in_flight
            .get(&job_id)
            .or_else(|| state.completed.iter().find(|j| j.id == job_id))
            .or_else(|| state.failed.iter().find(|j| j.id == job_id))
            .or_else(|| state.pending.iter().find(|j| j.id == job_id))
            .cloned()
    }

    /// Clones of the completed jobs, in completion order.
    pub fn completed_results(&self) -> Vec<Job> {
        self.state.lock().completed.clone()
    }

    /// Clones of the permanently failed jobs.
    pub fn failed_jobs(&self) -> Vec<Job> {
        self.state.lock().failed.clone()
    }

    /// Clones of the jobs currently waiting in the pending queue.
    pub fn pending_jobs(&self) -> Vec<Job> {
        self.state.lock().pending.iter().cloned().collect()
    }

    /// Subscribes to the worker status event stream.
    pub fn subscribe_worker_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.worker_events.subscribe()
    }

    /// Worker status events as a `Stream`.
    pub fn worker_event_stream(&self) -> BroadcastStream<WorkerEvent> {
        BroadcastStream::new(self.worker_events.subscribe())
    }

    /// Subscribes to terminal job notifications.
    pub fn subscribe_job_events(&self) -> broadcast::Receiver<JobEvent> {
        self.job_events.subscribe()
    }

    /// The per-job log router, for wiring progress callbacks outside of
    /// [`QueueManager::await_job`].
    pub fn log_router(&self) -> &Arc<JobLogRouter> {
        &self.log_router
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        // Detached execution tasks may still hold the token.
        self.cancel.lock().cancel();
    }
}
