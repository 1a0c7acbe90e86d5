//! Job definitions for the scheduler.
//!
//! - `JobSpec`: what a caller submits (title, prompt, passthrough metadata)
//! - `Job`: the queue's own lifecycle record for a submitted spec
//! - `JobStatus` / `JobPriority`: lifecycle and scheduling class
//! - `ExecutionOutcome`: what a worker reports back after one execution

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Specification for a generation job, as submitted by a caller.
///
/// The scheduler never inspects `metadata`; it is carried through unchanged
/// and handed back with the terminal result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable description, used only for logs and progress UI.
    pub title: String,
    /// Opaque request payload handed to the generation capability.
    pub prompt: String,
    /// Arbitrary caller context, passed through untouched.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl JobSpec {
    /// Creates a new job specification.
    pub fn new(title: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            prompt: prompt.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attaches caller metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in the pending queue.
    Queued,
    /// Assigned to exactly one worker and executing.
    Processing,
    /// Terminal: finished successfully, result recorded.
    Completed,
    /// Terminal: gave up after exhausting distinct-worker attempts.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Scheduling class of a job.
///
/// `High` jobs are selected before normal jobs when multiple are eligible;
/// within a class, submission order is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JobPriority {
    #[default]
    Normal,
    High,
}

/// A job tracked by the queue manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at submission time.
    pub id: Uuid,
    /// Human-readable description.
    pub title: String,
    /// Opaque request payload.
    pub prompt: String,
    /// Caller context, never inspected by the scheduler.
    pub metadata: serde_json::Value,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Scheduling class; escalated to `High` when the job is re-queued.
    pub priority: JobPriority,
    /// Local attempts made by the execution that produced the terminal state.
    pub attempts: u32,
    /// Workers that have already failed on this job. Grows monotonically;
    /// only `retry_failed_jobs` resets it.
    pub excluded_workers: HashSet<String>,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the current (or last) execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed, if it did.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the job was finalized as failed, if it was.
    pub failed_at: Option<DateTime<Utc>>,
    /// Worker currently assigned, or the one that produced the terminal state.
    pub worker_id: Option<String>,
    /// Generated text, present once completed.
    pub result: Option<String>,
    /// Recorded error, present once failed.
    pub error: Option<String>,
}

impl Job {
    /// Creates a queued job from a spec, assigning a fresh id.
    pub fn from_spec(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: spec.title,
            prompt: spec.prompt,
            metadata: spec.metadata,
            status: JobStatus::Queued,
            priority: JobPriority::Normal,
            attempts: 0,
            excluded_workers: HashSet::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            worker_id: None,
            result: None,
            error: None,
        }
    }

    /// Whether the job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    /// Marks the job as assigned to `worker_id` and processing.
    pub(crate) fn mark_assigned(&mut self, worker_id: &str) {
        self.status = JobStatus::Processing;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(Utc::now());
    }

    /// Returns the job to the queued state, excluding the worker that failed
    /// it and escalating priority so it is retried as soon as possible.
    pub(crate) fn mark_requeued(&mut self, exclude_worker_id: &str) {
        self.excluded_workers.insert(exclude_worker_id.to_string());
        self.status = JobStatus::Queued;
        self.priority = JobPriority::High;
        self.worker_id = None;
        self.started_at = None;
    }

    /// Returns the job to the queued state without penalty. Used when an
    /// execution was cancelled rather than failed.
    pub(crate) fn mark_interrupted(&mut self) {
        self.status = JobStatus::Queued;
        self.worker_id = None;
        self.started_at = None;
    }

    /// Finalizes the job as completed.
    pub(crate) fn mark_completed(&mut self, result: String, attempts: u32, worker_id: &str) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.attempts = attempts;
        self.worker_id = Some(worker_id.to_string());
        self.completed_at = Some(Utc::now());
    }

    /// Finalizes the job as failed.
    pub(crate) fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.failed_at = Some(Utc::now());
    }

    /// Resets the job for a completely fresh set of attempts, clearing
    /// attempt counts, error state and the exclusion history.
    pub(crate) fn reset_for_retry(&mut self) {
        self.status = JobStatus::Queued;
        self.priority = JobPriority::Normal;
        self.attempts = 0;
        self.excluded_workers.clear();
        self.worker_id = None;
        self.started_at = None;
        self.failed_at = None;
        self.error = None;
    }
}

/// How a single worker execution ended.
#[derive(Debug, Clone)]
pub enum OutcomeKind {
    /// Non-empty generated text.
    Success(String),
    /// Exhausted local retries or hit a non-retryable error.
    Failure {
        /// Last error observed.
        error: String,
        /// Whether another worker should be given the job.
        requeue: bool,
    },
    /// Cancellation was observed; not a failure, carries no penalty.
    Cancelled,
}

/// Result of one worker execution, reported back to the queue manager.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Worker that executed the job.
    pub worker_id: String,
    /// Local attempts made during this execution.
    pub attempts: u32,
    /// How the execution ended.
    pub kind: OutcomeKind,
}

impl ExecutionOutcome {
    /// Whether this outcome is a success.
    pub fn is_success(&self) -> bool {
        matches!(self.kind, OutcomeKind::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job() -> Job {
        Job::from_spec(JobSpec::new("Premise for chapter 1", "write a premise"))
    }

    #[test]
    fn test_spec_builder() {
        let spec = JobSpec::new("Title", "Prompt")
            .with_metadata(serde_json::json!({"isPremise": true}));

        assert_eq!(spec.title, "Title");
        assert_eq!(spec.prompt, "Prompt");
        assert_eq!(spec.metadata["isPremise"], true);
    }

    #[test]
    fn test_from_spec_initial_state() {
        let job = make_job();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.attempts, 0);
        assert!(job.excluded_workers.is_empty());
        assert!(!job.is_terminal());
    }

    #[test]
    fn test_assignment_and_requeue() {
        let mut job = make_job();

        job.mark_assigned("worker-1");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.worker_id.as_deref(), Some("worker-1"));
        assert!(job.started_at.is_some());

        job.mark_requeued("worker-1");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, JobPriority::High);
        assert!(job.worker_id.is_none());
        assert!(job.started_at.is_none());
        assert!(job.excluded_workers.contains("worker-1"));

        // Requeueing from the same worker twice must not duplicate.
        job.mark_requeued("worker-1");
        assert_eq!(job.excluded_workers.len(), 1);
    }

    #[test]
    fn test_terminal_transitions() {
        let mut job = make_job();
        job.mark_completed("text".to_string(), 2, "worker-2");

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.is_terminal());
        assert_eq!(job.result.as_deref(), Some("text"));
        assert_eq!(job.attempts, 2);
        assert_eq!(job.worker_id.as_deref(), Some("worker-2"));

        let mut job = make_job();
        job.mark_failed("gave up".to_string());
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.is_terminal());
        assert_eq!(job.error.as_deref(), Some("gave up"));
    }

    #[test]
    fn test_reset_for_retry_clears_exclusions() {
        let mut job = make_job();
        job.mark_requeued("worker-1");
        job.mark_requeued("worker-2");
        job.mark_failed("exhausted".to_string());

        job.reset_for_retry();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.attempts, 0);
        assert!(job.excluded_workers.is_empty());
        assert!(job.error.is_none());
        assert!(job.failed_at.is_none());
    }

    #[test]
    fn test_interrupted_keeps_history() {
        let mut job = make_job();
        job.mark_requeued("worker-1");
        job.mark_assigned("worker-2");
        job.mark_interrupted();

        assert_eq!(job.status, JobStatus::Queued);
        // Exclusions survive interruption; only priority stays as it was.
        assert!(job.excluded_workers.contains("worker-1"));
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert_eq!(JobStatus::Processing.to_string(), "processing");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_job_serialization() {
        let job = make_job();
        let json = serde_json::to_string(&job).expect("serialization should work");
        let parsed: Job = serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.title, job.title);
        assert_eq!(parsed.status, job.status);
    }

    #[test]
    fn test_outcome_is_success() {
        let outcome = ExecutionOutcome {
            worker_id: "worker-1".to_string(),
            attempts: 1,
            kind: OutcomeKind::Success("text".to_string()),
        };
        assert!(outcome.is_success());

        let outcome = ExecutionOutcome {
            worker_id: "worker-1".to_string(),
            attempts: 5,
            kind: OutcomeKind::Failure {
                error: "overloaded".to_string(),
                requeue: true,
            },
        };
        assert!(!outcome.is_success());
    }
}
