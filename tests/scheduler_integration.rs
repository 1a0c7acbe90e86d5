//! End-to-end scheduler tests: pool assignment, local retries, cross-worker
//! failover, credential deactivation, and the completion waiter, all against
//! a scripted generator and aggressively shortened timers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use script_forge::error::{GenerationError, QueueError, WaitError};
use script_forge::llm::TextGenerator;
use script_forge::scheduler::{
    JobSpec, JobStatus, LogCallback, QueueConfig, QueueManager, WorkerConfig, WorkerStatus,
};

/// Generator whose behavior is scripted by the credential string:
/// `good*` succeeds, `bad-cred` raises a credential error, everything else
/// reports the model as overloaded.
struct ScriptedGenerator {
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        credential: &str,
        prompt: &str,
        _cancel: CancellationToken,
    ) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if credential.starts_with("good") {
            Ok(format!("generated: {}", prompt))
        } else if credential == "bad-cred" {
            Err(GenerationError::InvalidCredential(
                "API key not valid".to_string(),
            ))
        } else {
            Err(GenerationError::Overloaded("model is overloaded".to_string()))
        }
    }
}

fn fast_config() -> QueueConfig {
    QueueConfig::default()
        .with_tick_interval(Duration::from_millis(10))
        .with_wait_poll_interval(Duration::from_millis(10))
        .with_wait_timeout(Duration::from_secs(5))
        .with_worker_config(
            WorkerConfig::default()
                .with_max_local_retries(2)
                .with_retry_delay(Duration::from_millis(5))
                .with_cooldown(Duration::from_millis(50))
                .with_request_timeout(Duration::from_secs(1)),
        )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn make_manager(credentials: &[&str]) -> Arc<QueueManager> {
    init_tracing();
    let manager = Arc::new(QueueManager::with_config(
        ScriptedGenerator::new(),
        fast_config(),
    ));
    manager.initialize_workers(credentials.iter().map(|c| c.to_string()).collect());
    manager
}

/// Polls `predicate` every 10ms until it holds or `deadline` elapses.
async fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let started = std::time::Instant::now();
    loop {
        if predicate() {
            return true;
        }
        if started.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_pool_drains_queue() {
    let manager = make_manager(&["good-1", "good-2", "good-3"]);
    let ids = manager.add_jobs(vec![
        JobSpec::new("Premise", "premise prompt"),
        JobSpec::new("Block 1", "block 1 prompt"),
        JobSpec::new("Block 2", "block 2 prompt"),
        JobSpec::new("Block 3", "block 3 prompt"),
        JobSpec::new("Block 4", "block 4 prompt"),
    ]);
    manager.start().expect("start should succeed");

    let drained = wait_until(Duration::from_secs(5), || {
        manager.status().completed == 5
    })
    .await;
    assert!(drained, "all jobs should complete");

    let completed = manager.completed_results();
    assert_eq!(completed.len(), 5);
    for job in &completed {
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
        assert!(ids.contains(&job.id));
        let result = job.result.as_deref().expect("completed job has a result");
        assert!(result.starts_with("generated: "));
    }

    let status = manager.status();
    assert_eq!(status.queue, 0);
    assert_eq!(status.processing, 0);
    assert_eq!(status.stats.completed, 5);
    assert_eq!(status.stats.failed, 0);

    manager.stop();
}

#[tokio::test]
async fn test_failover_to_second_worker() {
    let manager = make_manager(&["flaky-1", "good-2"]);
    let ids = manager.add_jobs(vec![JobSpec::new("Premise", "premise prompt")]);
    manager.start().expect("start should succeed");

    let done = wait_until(Duration::from_secs(5), || {
        manager.status().completed == 1
    })
    .await;
    assert!(done, "job should fail over and complete");

    let job = &manager.completed_results()[0];
    assert_eq!(job.id, ids[0]);
    assert_eq!(job.worker_id.as_deref(), Some("worker-2"));
    assert!(job.excluded_workers.contains("worker-1"));
    assert_eq!(job.attempts, 1);

    manager.stop();
}

#[tokio::test]
async fn test_distinct_worker_ceiling_finalizes_failure() {
    let manager = make_manager(&["flaky-1", "flaky-2", "flaky-3"]);
    manager.add_jobs(vec![JobSpec::new("Premise", "premise prompt")]);
    manager.start().expect("start should succeed");

    let failed = wait_until(Duration::from_secs(10), || {
        manager.status().failed == 1
    })
    .await;
    assert!(failed, "job should be finalized after the worker ceiling");

    let job = &manager.failed_jobs()[0];
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.as_deref().expect("failed job carries an error");
    assert!(error.contains("3 workers"), "unexpected error: {}", error);
    assert!(error.contains("overloaded"), "unexpected error: {}", error);

    let status = manager.status();
    assert_eq!(status.queue, 0);
    assert_eq!(status.completed, 0);

    manager.stop();
}

#[tokio::test]
async fn test_credential_failure_deactivates_worker_and_parks_job() {
    let manager = make_manager(&["bad-cred"]);
    manager.add_jobs(vec![JobSpec::new("Premise", "premise prompt")]);
    manager.start().expect("start should succeed");

    let disabled = wait_until(Duration::from_secs(5), || {
        let status = manager.status();
        !status.workers[0].is_active && status.queue == 1
    })
    .await;
    assert!(disabled, "worker should be deactivated with the job re-queued");

    // With no other workers, the job just waits. A stop/start cycle keeps it.
    manager.stop();
    manager.start().expect("restart should succeed");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.status().queue, 1);
    assert_eq!(manager.status().failed, 0);

    manager.stop();
}

#[tokio::test]
async fn test_start_requires_workers() {
    let manager = Arc::new(QueueManager::with_config(
        ScriptedGenerator::new(),
        fast_config(),
    ));

    assert!(matches!(manager.start(), Err(QueueError::NoWorkers)));
}

#[tokio::test]
async fn test_retry_failed_jobs_resets_history() {
    let manager = Arc::new(QueueManager::with_config(
        ScriptedGenerator::new(),
        fast_config().with_max_unique_worker_attempts(1),
    ));
    manager.initialize_workers(vec!["flaky-1".to_string()]);
    manager.add_jobs(vec![JobSpec::new("Premise", "premise prompt")]);
    manager.start().expect("start should succeed");

    let failed = wait_until(Duration::from_secs(5), || {
        manager.status().failed == 1
    })
    .await;
    assert!(failed);
    manager.stop();

    manager.retry_failed_jobs();

    let pending = manager.pending_jobs();
    assert_eq!(pending.len(), 1);
    let job = &pending[0];
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 0);
    assert!(job.excluded_workers.is_empty());
    assert!(job.error.is_none());
    assert_eq!(manager.status().failed, 0);
}

#[tokio::test]
async fn test_clear_resets_after_activity() {
    let manager = make_manager(&["good-1"]);
    manager.add_jobs(vec![
        JobSpec::new("Premise", "premise prompt"),
        JobSpec::new("Block 1", "block 1 prompt"),
    ]);
    manager.start().expect("start should succeed");

    wait_until(Duration::from_secs(5), || manager.status().completed == 2).await;

    manager.clear();

    let status = manager.status();
    assert!(!status.is_running);
    assert_eq!(status.queue, 0);
    assert_eq!(status.completed, 0);
    assert_eq!(status.failed, 0);
    assert_eq!(status.stats.total_jobs, 0);
}

#[tokio::test]
async fn test_await_job_returns_generated_text() {
    let manager = make_manager(&["good-1"]);
    let ids = manager.add_jobs(vec![JobSpec::new("Premise", "premise prompt")]);
    manager.start().expect("start should succeed");

    let text = manager
        .await_job(ids[0], Duration::from_secs(5), None)
        .await
        .expect("job should complete within the wait budget");
    assert_eq!(text, "generated: premise prompt");

    manager.stop();
}

#[tokio::test]
async fn test_await_job_reports_failure_through_callback() {
    let manager = Arc::new(QueueManager::with_config(
        ScriptedGenerator::new(),
        fast_config().with_max_unique_worker_attempts(1),
    ));
    manager.initialize_workers(vec!["flaky-1".to_string()]);
    let ids = manager.add_jobs(vec![JobSpec::new("Premise", "premise prompt")]);
    manager.start().expect("start should succeed");

    let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let callback: LogCallback = Arc::new(move |message, _level| {
        sink.lock().push(message.to_string());
    });

    let result = manager
        .await_job(ids[0], Duration::from_secs(5), Some(callback))
        .await;

    match result {
        Err(WaitError::JobFailed(reason)) => assert!(reason.contains("overloaded")),
        other => panic!("expected JobFailed, got {:?}", other),
    }
    // The waiter's terminal notice always reaches the callback.
    assert!(lines.lock().iter().any(|line| line.starts_with("Failed:")));
    assert!(manager.log_router().is_empty());

    manager.stop();
}

#[tokio::test]
async fn test_worker_events_cover_the_attempt_lifecycle() {
    let manager = make_manager(&["good-1"]);
    let mut events = manager.subscribe_worker_events();
    manager.add_jobs(vec![JobSpec::new("Premise", "premise prompt")]);
    manager.start().expect("start should succeed");

    let mut seen = Vec::new();
    let collected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel should stay open");
            let status = event.status;
            seen.push(status);
            if status == WorkerStatus::Success {
                break;
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "never saw a success event: {:?}", seen);

    assert!(seen.contains(&WorkerStatus::Processing));
    assert!(seen.contains(&WorkerStatus::Attempting));
    assert!(seen.contains(&WorkerStatus::Success));

    manager.stop();
}

#[tokio::test]
async fn test_restart_workers_revives_disabled_pool() {
    let manager = make_manager(&["bad-cred"]);
    manager.add_jobs(vec![JobSpec::new("Premise", "premise prompt")]);
    manager.start().expect("start should succeed");

    let disabled = wait_until(Duration::from_secs(5), || {
        !manager.status().workers[0].is_active
    })
    .await;
    assert!(disabled);

    manager.restart_workers();
    assert!(manager.status().workers[0].is_active);

    manager.stop();
}
