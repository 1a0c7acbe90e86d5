//! Blocking-style completion waiting on top of the queue.
//!
//! The queue itself is fire-and-forget; callers that want a synchronous
//! "submit, then give me the text" flow poll through [`QueueManager::await_job`].
//! While waiting, per-attempt progress reaches the caller through the job's
//! registered log callback.

use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::error::WaitError;

use super::job::JobStatus;
use super::log_router::{LogCallback, LogLevel};
use super::queue::QueueManager;

impl QueueManager {
    /// Waits for a job to reach a terminal state, polling at the configured
    /// interval, and returns the generated text on success.
    ///
    /// `log_callback`, when given, is registered with the log router for the
    /// duration of the wait so per-attempt progress reaches the caller. The
    /// registration is always removed before returning.
    ///
    /// Fails with [`WaitError::QueueNotActive`] if the queue is not running,
    /// [`WaitError::JobFailed`] if the job was finalized as failed, and
    /// [`WaitError::Timeout`] once `timeout` elapses without a terminal state.
    pub async fn await_job(
        &self,
        job_id: Uuid,
        timeout: Duration,
        log_callback: Option<LogCallback>,
    ) -> Result<String, WaitError> {
        if let Some(callback) = log_callback {
            self.log_router().register(job_id, callback);
        }

        if !self.is_running() {
            self.log_router().remove(job_id);
            return Err(WaitError::QueueNotActive);
        }

        let started = Instant::now();
        loop {
            if let Some(job) = self.get_job(job_id) {
                match job.status {
                    JobStatus::Completed => {
                        self.log_router().remove(job_id);
                        debug!(job_id = %job_id, "Wait finished: job completed");
                        return Ok(job.result.unwrap_or_default());
                    }
                    JobStatus::Failed => {
                        let reason = job.error.unwrap_or_else(|| "Unknown error".to_string());
                        self.log_router()
                            .notify(job_id, &format!("Failed: {}", reason), LogLevel::Error);
                        self.log_router().remove(job_id);
                        return Err(WaitError::JobFailed(reason));
                    }
                    JobStatus::Queued | JobStatus::Processing => {}
                }
            }

            if !self.is_running() {
                self.log_router().remove(job_id);
                return Err(WaitError::QueueNotActive);
            }

            if started.elapsed() >= timeout {
                self.log_router().notify(
                    job_id,
                    &format!("Timed out after {}s", timeout.as_secs_f64()),
                    LogLevel::Error,
                );
                self.log_router().remove(job_id);
                return Err(WaitError::Timeout(timeout));
            }

            tokio::time::sleep(self.config().wait_poll_interval).await;
        }
    }

    /// [`QueueManager::await_job`] with the configured default wait budget.
    pub async fn await_job_default(
        &self,
        job_id: Uuid,
        log_callback: Option<LogCallback>,
    ) -> Result<String, WaitError> {
        self.await_job(job_id, self.config().wait_timeout, log_callback)
            .await
    }
}
