//! Job scheduling over a pool of credential-bound workers.
//!
//! Architecture:
//! - [`queue::QueueManager`] owns the pending queue and all bookkeeping. A
//!   recurring tick assigns each eligible worker the first compatible job,
//!   respecting priority and per-job worker exclusions.
//! - [`worker::Worker`] wraps one credential and runs one job at a time, with
//!   bounded local retries, a fixed inter-attempt delay, a per-call hard
//!   timeout, and a cooldown after exhaustion. Credential errors deactivate
//!   the worker permanently.
//! - When a worker gives a job up, the manager re-queues it at the front with
//!   escalated priority for a different worker, up to a distinct-worker
//!   ceiling; after that the job is finalized as failed.
//! - [`log_router::JobLogRouter`] fans worker status events out to per-job
//!   callbacks, and `QueueManager::await_job` (in [`waiter`]) turns the
//!   fire-and-forget queue into a blocking-style call.

pub mod job;
pub mod log_router;
pub mod queue;
pub mod waiter;
pub mod worker;

pub use job::{ExecutionOutcome, Job, JobPriority, JobSpec, JobStatus, OutcomeKind};
pub use log_router::{JobLogRouter, LogCallback, LogLevel};
pub use queue::{JobEvent, JobSummary, QueueConfig, QueueManager, QueueStats, QueueStatus};
pub use worker::{
    Worker, WorkerConfig, WorkerEvent, WorkerInfo, WorkerState, WorkerStats, WorkerStatus,
};
