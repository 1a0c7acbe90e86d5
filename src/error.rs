//! Error types for script-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Text generation (the external capability and its failure taxonomy)
//! - Queue manager lifecycle operations
//! - Job-completion waiting

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the text-generation capability.
///
/// The variant determines how the scheduler reacts:
/// - [`GenerationError::InvalidCredential`] permanently disables the worker
///   that made the call.
/// - [`GenerationError::Cancelled`] stops retries without penalty.
/// - Everything else is a transient failure, retried locally and then
///   failed over to another worker.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    /// The API key was rejected (invalid, unauthorized or forbidden).
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// The call observed cancellation and aborted.
    #[error("Generation cancelled")]
    Cancelled,

    /// The backend answered successfully but with no text.
    #[error("Empty response from generation backend")]
    EmptyResponse,

    /// Rate limit or quota exhaustion.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The model is overloaded and temporarily refusing work.
    #[error("Model overloaded: {0}")]
    Overloaded(String),

    /// The response was blocked by a safety filter.
    #[error("Safety filter rejected the prompt: {0}")]
    SafetyFiltered(String),

    /// Network-level failure (connect, DNS, broken transfer).
    #[error("Network error: {0}")]
    Network(String),

    /// The request exceeded its hard deadline.
    #[error("Generation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Any other backend error with its HTTP status code.
    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },
}

impl GenerationError {
    /// Whether this error means the credential itself is unusable.
    pub fn is_credential(&self) -> bool {
        matches!(self, GenerationError::InvalidCredential(_))
    }

    /// Whether this error was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenerationError::Cancelled)
    }

    /// Whether this error is worth retrying on the same worker.
    pub fn is_transient(&self) -> bool {
        !self.is_credential() && !self.is_cancelled()
    }

    /// Classifies an error message the way the original backend reported
    /// failures: by substring. Used by HTTP clients whose backend collapses
    /// everything into a `message` field.
    pub fn from_message(code: u16, message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("api key")
            || lower.contains("unauthorized")
            || lower.contains("invalid key")
            || lower.contains("forbidden")
            || code == 401
            || code == 403
        {
            return GenerationError::InvalidCredential(message.to_string());
        }
        if lower.contains("quota") || lower.contains("rate limit") || code == 429 {
            return GenerationError::RateLimited(message.to_string());
        }
        if lower.contains("overloaded") {
            return GenerationError::Overloaded(message.to_string());
        }
        if lower.contains("safety") || lower.contains("filter") {
            return GenerationError::SafetyFiltered(message.to_string());
        }
        GenerationError::Api {
            code,
            message: message.to_string(),
        }
    }
}

/// Errors that can occur during queue manager operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// `start()` was called before any workers were initialized.
    #[error("No workers available; call initialize_workers first")]
    NoWorkers,

    /// The requested job is not known to the queue.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
}

/// Errors returned to callers waiting on a job's terminal result.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The job did not reach a terminal state within the wait budget.
    /// The job itself may still complete later; only this waiter gave up.
    #[error("Timed out after {0:?} waiting for job completion")]
    Timeout(Duration),

    /// The queue was stopped (or never started) while waiting.
    #[error("Queue is not active")]
    QueueNotActive,

    /// The job reached the failed list; carries the recorded error.
    #[error("Job failed: {0}")]
    JobFailed(String),
}
