//! Per-job log routing.
//!
//! Maps job ids to caller-supplied log callbacks so progress can reach the
//! right piece of UI without the scheduler knowing anything about rendering.
//! Registrations are added when a caller starts awaiting a job and removed
//! when the job reaches a terminal state or the waiter times out; a size
//! bound with emergency eviction protects against orphaned registrations.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::worker::{WorkerEvent, WorkerStatus};

/// Severity attached to a routed log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Error,
}

/// A caller-supplied progress callback.
pub type LogCallback = Arc<dyn Fn(&str, LogLevel) + Send + Sync>;

/// Default registration capacity before emergency eviction.
const DEFAULT_MAX_ENTRIES: usize = 500;

/// How many of the oldest registrations an emergency eviction removes.
const DEFAULT_EVICT_BATCH: usize = 100;

#[derive(Default)]
struct RouterInner {
    callbacks: HashMap<Uuid, LogCallback>,
    /// Registration order; may contain stale ids, skipped during eviction.
    order: VecDeque<Uuid>,
}

/// Routes worker status events to per-job log callbacks.
pub struct JobLogRouter {
    max_entries: usize,
    evict_batch: usize,
    inner: Mutex<RouterInner>,
}

impl Default for JobLogRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLogRouter {
    /// Creates a router with the default capacity bounds.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES, DEFAULT_EVICT_BATCH)
    }

    /// Creates a router with explicit capacity bounds.
    pub fn with_capacity(max_entries: usize, evict_batch: usize) -> Self {
        Self {
            max_entries,
            evict_batch: evict_batch.max(1),
            inner: Mutex::new(RouterInner::default()),
        }
    }

    /// Registers a callback for a job, evicting the oldest registrations if
    /// the map has grown unexpectedly large.
    pub fn register(&self, job_id: Uuid, callback: LogCallback) {
        let mut inner = self.inner.lock();

        if inner.callbacks.len() >= self.max_entries {
            let mut evicted = 0;
            while evicted < self.evict_batch {
                let Some(old) = inner.order.pop_front() else {
                    break;
                };
                if inner.callbacks.remove(&old).is_some() {
                    evicted += 1;
                }
            }
            warn!(evicted, "Emergency eviction of orphaned log registrations");
        }

        inner.callbacks.remove(&job_id);
        inner.callbacks.insert(job_id, callback);
        inner.order.push_back(job_id);
    }

    /// Removes a job's registration, if present.
    pub fn remove(&self, job_id: Uuid) {
        self.inner.lock().callbacks.remove(&job_id);
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// Whether no registrations exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Routes one worker event to the callback registered for its job, if
    /// any. Events without a job id, and status kinds with no UI meaning,
    /// are dropped.
    pub fn dispatch(&self, event: &WorkerEvent) {
        let Some(job_id) = event.job_id else {
            return;
        };
        let level = match event.status {
            WorkerStatus::Attempting | WorkerStatus::Waiting => LogLevel::Info,
            WorkerStatus::Success => LogLevel::Success,
            WorkerStatus::Error => LogLevel::Error,
            _ => return,
        };
        let callback = self.inner.lock().callbacks.get(&job_id).cloned();
        if let Some(callback) = callback {
            callback(&event.message, level);
        }
    }

    /// Sends a message directly to a job's callback, bypassing event
    /// translation. Used by the waiter for its own terminal notices.
    pub fn notify(&self, job_id: Uuid, message: &str, level: LogLevel) {
        let callback = self.inner.lock().callbacks.get(&job_id).cloned();
        if let Some(callback) = callback {
            callback(message, level);
        }
    }
}
