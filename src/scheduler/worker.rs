//! Credential-bound worker with local retry, cooldown and failure tracking.
//!
//! A worker wraps exactly one API key and executes one job at a time against
//! it. Local retries, the delay between them, the per-call hard timeout and
//! the post-exhaustion cooldown all live here; the queue manager only decides
//! whether to hand the job to a different worker afterwards.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GenerationError;
use crate::llm::TextGenerator;

use super::job::{ExecutionOutcome, Job, OutcomeKind};

/// Configuration for a worker's retry and cooldown policy.
///
/// Defaults match the reference behavior; every knob is tunable.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Local attempts per execution before giving the job up.
    pub max_local_retries: u32,
    /// Fixed delay between local attempts.
    pub retry_delay: Duration,
    /// Cooldown applied after exhausting local retries, regardless of the
    /// error category.
    pub cooldown: Duration,
    /// Hard deadline for a single generation call, independent of the
    /// retry and cooldown timers.
    pub request_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_local_retries: 5,
            retry_delay: Duration::from_secs(20),
            cooldown: Duration::from_secs(60),
            request_timeout: Duration::from_secs(90),
        }
    }
}

impl WorkerConfig {
    /// Sets the local retry limit.
    pub fn with_max_local_retries(mut self, retries: u32) -> Self {
        self.max_local_retries = retries.max(1);
        self
    }

    /// Sets the delay between local attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the post-exhaustion cooldown duration.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the per-call hard timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Status transition reported by a worker. Purely observational; scheduling
/// never depends on anyone consuming these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Picked up a job.
    Processing,
    /// Starting one local attempt.
    Attempting,
    /// The job produced a result.
    Success,
    /// An attempt (or the whole execution) failed.
    Error,
    /// Sleeping between local attempts.
    Waiting,
    /// Permanently deactivated by a credential error.
    Disabled,
    /// Entered cooldown after exhausting local retries.
    Cooldown,
    /// Became eligible again (cooldown over, or restarted).
    Idle,
    /// Stopped by the queue manager.
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Processing => "processing",
            WorkerStatus::Attempting => "attempting",
            WorkerStatus::Success => "success",
            WorkerStatus::Error => "error",
            WorkerStatus::Waiting => "waiting",
            WorkerStatus::Disabled => "disabled",
            WorkerStatus::Cooldown => "cooldown",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time state of a worker, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Not active (stopped or credential failure).
    Disabled,
    /// Idle but ineligible until the cooldown passes.
    Cooldown,
    /// Executing a job.
    Busy,
    /// Eligible for new work.
    Idle,
}

/// A status transition event emitted by a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerEvent {
    /// Worker that emitted the event.
    pub worker_id: String,
    /// Job the event relates to, when relevant.
    pub job_id: Option<Uuid>,
    /// Kind of transition.
    pub status: WorkerStatus,
    /// Human-readable message, suitable for progress UI.
    pub message: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

/// Monitoring counters for a worker. No control implications.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Jobs this worker picked up.
    pub processed: u64,
    /// Jobs that succeeded on this worker.
    pub successful: u64,
    /// Executions that ended in failure.
    pub failed: u64,
    /// Local retries beyond each first attempt.
    pub total_retries: u64,
}

/// Shared counters backing [`WorkerStats`].
#[derive(Debug, Default)]
struct SharedWorkerStats {
    processed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    total_retries: AtomicU64,
}

impl SharedWorkerStats {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::SeqCst),
            successful: self.successful.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            total_retries: self.total_retries.load(Ordering::SeqCst),
        }
    }
}

/// Detailed worker information for status snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    /// Worker identifier.
    pub id: String,
    /// Truncated credential preview, safe for display.
    pub credential_preview: String,
    /// Derived state.
    pub state: WorkerState,
    /// Whether the worker is active.
    pub is_active: bool,
    /// Whether the worker is idle.
    pub is_available: bool,
    /// Title of the job currently executing, if any.
    pub current_job: Option<String>,
    /// Whole-execution failures since the last success.
    pub consecutive_failures: u32,
    /// Last error message observed.
    pub last_error: Option<String>,
    /// Remaining cooldown, if in cooldown.
    pub cooldown_remaining_ms: Option<u64>,
    /// Monitoring counters.
    pub stats: WorkerStats,
}

/// A worker bound to a single credential.
pub struct Worker {
    id: String,
    credential: String,
    config: WorkerConfig,
    generator: Arc<dyn TextGenerator>,
    active: AtomicBool,
    available: AtomicBool,
    consecutive_failures: AtomicU32,
    cooldown_until: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
    current_job: Mutex<Option<(Uuid, String)>>,
    stats: SharedWorkerStats,
    events: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    /// Creates a new worker bound to `credential`.
    pub fn new(
        id: impl Into<String>,
        credential: impl Into<String>,
        config: WorkerConfig,
        generator: Arc<dyn TextGenerator>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            id: id.into(),
            credential: credential.into(),
            config,
            generator,
            active: AtomicBool::new(true),
            available: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            cooldown_until: Mutex::new(None),
            last_error: Mutex::new(None),
            current_job: Mutex::new(None),
            stats: SharedWorkerStats::default(),
            events,
        }
    }

    /// Returns the worker's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the worker is active.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the worker is idle (no job assigned).
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Whether the worker can take a new job right now: active, idle, and
    /// past any cooldown.
    pub fn is_ready_for_work(&self) -> bool {
        if !self.is_active() || !self.is_available() {
            return false;
        }
        match *self.cooldown_until.lock() {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Marks the worker unavailable at assignment time, before the execution
    /// task has had a chance to run. Prevents a later scheduling tick from
    /// double-booking the worker.
    pub(crate) fn reserve(&self) {
        self.available.store(false, Ordering::SeqCst);
    }

    /// Executes one job with bounded local retries.
    ///
    /// Returns a structured outcome; domain failures never surface as panics
    /// or `Err`. On exhaustion the worker frees itself immediately and enters
    /// cooldown so the queue can hand the job to another worker.
    pub async fn execute(
        self: &Arc<Self>,
        job: &Job,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        self.available.store(false, Ordering::SeqCst);
        *self.current_job.lock() = Some((job.id, job.title.clone()));
        self.stats.processed.fetch_add(1, Ordering::SeqCst);
        self.emit(
            WorkerStatus::Processing,
            format!("Processing: {}", truncate(&job.title, 50)),
            Some(job.id),
        );

        let max = self.config.max_local_retries;
        let mut attempts: u32 = 0;
        let mut last_error: Option<String> = None;
        let mut cancelled = false;
        let mut credential_failure = false;

        while attempts < max && self.is_active() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            attempts += 1;
            if attempts > 1 {
                self.stats.total_retries.fetch_add(1, Ordering::SeqCst);
            }
            self.emit(
                WorkerStatus::Attempting,
                format!("{}: attempt {}/{}", job.title, attempts, max),
                Some(job.id),
            );

            if attempts > 1 {
                self.emit(
                    WorkerStatus::Waiting,
                    format!(
                        "Waiting {}s before retry",
                        self.config.retry_delay.as_secs_f64()
                    ),
                    Some(job.id),
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                    _ = cancel.cancelled() => {
                        cancelled = true;
                    }
                }
                if cancelled {
                    break;
                }
            }

            let call = self
                .generator
                .generate(&self.credential, &job.prompt, cancel.clone());
            let error = match tokio::time::timeout(self.config.request_timeout, call).await {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    self.stats.successful.fetch_add(1, Ordering::SeqCst);
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    *self.last_error.lock() = None;
                    *self.current_job.lock() = None;
                    self.available.store(true, Ordering::SeqCst);
                    self.emit(
                        WorkerStatus::Success,
                        format!("{} generated successfully", job.title),
                        Some(job.id),
                    );
                    return ExecutionOutcome {
                        worker_id: self.id.clone(),
                        attempts,
                        kind: OutcomeKind::Success(text),
                    };
                }
                Ok(Ok(_)) => GenerationError::EmptyResponse,
                Ok(Err(e)) => e,
                Err(_) => GenerationError::Timeout {
                    seconds: self.config.request_timeout.as_secs(),
                },
            };

            *self.last_error.lock() = Some(error.to_string());
            warn!(
                worker_id = %self.id,
                job_id = %job.id,
                attempt = attempts,
                error = %error,
                "Generation attempt failed"
            );
            self.emit(
                WorkerStatus::Error,
                format!("{}: attempt {} failed ({})", job.title, attempts, error),
                Some(job.id),
            );

            if error.is_cancelled() || cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if error.is_credential() {
                self.active.store(false, Ordering::SeqCst);
                self.emit(WorkerStatus::Disabled, "Invalid API key".to_string(), Some(job.id));
                credential_failure = true;
                last_error = Some(error.to_string());
                break;
            }
            last_error = Some(error.to_string());
        }

        // Free the worker immediately, whatever happened.
        *self.current_job.lock() = None;
        self.available.store(true, Ordering::SeqCst);

        if cancelled {
            debug!(worker_id = %self.id, job_id = %job.id, "Execution cancelled");
            return ExecutionOutcome {
                worker_id: self.id.clone(),
                attempts,
                kind: OutcomeKind::Cancelled,
            };
        }

        self.stats.failed.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);

        if !credential_failure {
            // Flat cooldown regardless of error category.
            self.apply_cooldown();
            self.emit(
                WorkerStatus::Error,
                format!("Failed {} attempts; releasing job to another worker", attempts),
                Some(job.id),
            );
        }

        info!(
            worker_id = %self.id,
            job_id = %job.id,
            attempts,
            "Execution exhausted on this worker"
        );

        ExecutionOutcome {
            worker_id: self.id.clone(),
            attempts,
            kind: OutcomeKind::Failure {
                error: last_error.unwrap_or_else(|| "Unknown error".to_string()),
                requeue: true,
            },
        }
    }

    /// Enters cooldown and schedules the auto-release notification.
    fn apply_cooldown(self: &Arc<Self>) {
        let until = Instant::now() + self.config.cooldown;
        *self.cooldown_until.lock() = Some(until);
        self.emit(
            WorkerStatus::Cooldown,
            format!("Worker in cooldown for {}s", self.config.cooldown.as_secs_f64()),
            None,
        );

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(worker.config.cooldown).await;
            let released = {
                let mut guard = worker.cooldown_until.lock();
                match *guard {
                    Some(until) if Instant::now() >= until => {
                        *guard = None;
                        true
                    }
                    _ => false,
                }
            };
            if released {
                worker.emit(
                    WorkerStatus::Idle,
                    "Cooldown complete; ready for work".to_string(),
                    None,
                );
            }
        });
    }

    /// Graceful shutdown. Uses the same flag as credential-failure
    /// deactivation but is reversible via [`Worker::restart`].
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.emit(WorkerStatus::Stopped, "Worker stopped".to_string(), None);
    }

    /// Makes the worker fully eligible again: clears the active flag,
    /// failure counters and any cooldown.
    pub fn restart(&self) {
        self.active.store(true, Ordering::SeqCst);
        self.available.store(true, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.cooldown_until.lock() = None;
        *self.last_error.lock() = None;
        self.emit(WorkerStatus::Idle, "Worker restarted".to_string(), None);
    }

    /// Derived point-in-time state.
    pub fn state(&self) -> WorkerState {
        if !self.is_active() {
            return WorkerState::Disabled;
        }
        if let Some(until) = *self.cooldown_until.lock() {
            if Instant::now() < until {
                return WorkerState::Cooldown;
            }
        }
        if !self.is_available() {
            return WorkerState::Busy;
        }
        WorkerState::Idle
    }

    /// Detailed snapshot for status reporting.
    pub fn info(&self) -> WorkerInfo {
        let cooldown_remaining_ms = (*self.cooldown_until.lock()).and_then(|until| {
            let now = Instant::now();
            (now < until).then(|| (until - now).as_millis() as u64)
        });

        WorkerInfo {
            id: self.id.clone(),
            credential_preview: format!("{}...", truncate(&self.credential, 10)),
            state: self.state(),
            is_active: self.is_active(),
            is_available: self.is_available(),
            current_job: self.current_job.lock().as_ref().map(|(_, title)| title.clone()),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_error: self.last_error.lock().clone(),
            cooldown_remaining_ms,
            stats: self.stats.snapshot(),
        }
    }

    fn emit(&self, status: WorkerStatus, message: String, job_id: Option<Uuid>) {
        let job_id = job_id.or_else(|| self.current_job.lock().as_ref().map(|(id, _)| *id));
        // No receivers is fine; events are purely observational.
        let _ = self.events.send(WorkerEvent {
            worker_id: self.id.clone(),
            job_id,
            status,
            message,
            timestamp: Utc::now(),
        });
    }
}

/// Truncates a string to at most `max` characters.
fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
