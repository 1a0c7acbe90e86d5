//! script-forge: worker-pool scheduler for AI script-generation jobs.
//!
//! This library coordinates many independent, API-key-bound workers pulling
//! generation jobs from a shared in-memory queue, with local retries,
//! cross-worker failover, cooldown, and exclusion-based redistribution.

pub mod error;
pub mod llm;
pub mod scheduler;

// Re-export commonly used types
pub use error::{GenerationError, QueueError, WaitError};
pub use llm::{BackendClient, BackendClientConfig, TextGenerator};
pub use scheduler::{
    Job, JobEvent, JobSpec, JobStatus, QueueConfig, QueueManager, QueueStatus, WorkerConfig,
    WorkerEvent,
};
