// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker loop: lease envelopes, execute them through a flow runtime,
//! record outcomes.
//!
//! Each worker process owns its queue handle, idempotency store, and
//! dead-letter store; coordination with siblings happens only through the
//! file queue's locks. A heartbeat file under the control directory tells
//! the supervisor the worker is alive; a `drain` flag file tells the worker
//! to finish its current lease and exit.

use serde_json::json;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tm_core::{
    Clock, FlowRunRecord, RetryConfig, RetryPolicy, RunStatus, StepError, SystemClock, WorkerId,
};
use tm_engine::{FlowRuntime, ManagerError, RunCtx, TaskQueueManager};
use tm_storage::{
    DeadLetterStore, DlqError, FileWorkQueue, IdempotencyResult, IdempotencyStore, LeasedTask,
    QueueError,
};
use tracing::{info, warn};

/// Name of the drain flag file inside the control directory.
pub const DRAIN_FLAG: &str = "drain";

/// Errors terminating a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("dead letter error: {0}")]
    DeadLetter(#[from] DlqError),
    #[error("manager error: {0}")]
    Manager(#[from] ManagerError),
    #[error("invalid retry config {path}: {message}")]
    RetryConfig { path: PathBuf, message: String },
}

/// Builds the runtime a worker executes envelopes through.
pub type RuntimeFactory = Arc<dyn Fn() -> FlowRuntime + Send + Sync>;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: WorkerId,
    pub queue_dir: PathBuf,
    pub idempotency_dir: PathBuf,
    pub dlq_dir: PathBuf,
    /// Heartbeat and drain-flag directory shared with the supervisor.
    pub control_dir: PathBuf,
    pub lease_ms: u64,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// TTL for results recorded into the idempotency cache.
    pub result_ttl_sec: f64,
    /// Optional JSON retry config (`{"retries": {"default": ...}}`).
    pub retry_config_path: Option<PathBuf>,
    /// Optional JSONL file receiving one line per completed task.
    pub result_log: Option<PathBuf>,
}

impl WorkerOptions {
    pub fn new(base_dir: &Path, worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            queue_dir: base_dir.join("queue"),
            idempotency_dir: base_dir.join("idem"),
            dlq_dir: base_dir.join("dlq"),
            control_dir: base_dir.join("control"),
            lease_ms: 30_000,
            batch_size: 4,
            poll_interval_ms: 100,
            heartbeat_interval_ms: 1_000,
            result_ttl_sec: 300.0,
            retry_config_path: None,
            result_log: None,
        }
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.control_dir.join(format!("worker-{}.hb", self.worker_id))
    }

    pub fn drain_path(&self) -> PathBuf {
        self.control_dir.join(DRAIN_FLAG)
    }
}

fn load_retry_policy(path: Option<&Path>) -> Result<RetryPolicy, WorkerError> {
    let Some(path) = path else {
        return Ok(RetryPolicy::default());
    };
    let raw = std::fs::read(path)?;
    let config: RetryConfig =
        serde_json::from_slice(&raw).map_err(|e| WorkerError::RetryConfig {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
    Ok(RetryPolicy::from_config(config))
}

fn write_heartbeat(path: &Path, clock: &SystemClock) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, clock.epoch_ms().to_string()) {
        warn!(path = %path.display(), error = %e, "heartbeat write failed");
    }
}

fn append_result_line(path: &Path, record: &FlowRunRecord, lease: &LeasedTask) {
    let line = json!({
        "task_id": lease.envelope.task_id,
        "flow_id": lease.envelope.flow_id,
        "run_id": record.run_id,
        "status": record.status,
        "attempt": lease.envelope.attempt,
    });
    let appended = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{line}"));
    if let Err(e) = appended {
        warn!(path = %path.display(), error = %e, "result log append failed");
    }
}

fn failure_from_record(record: &FlowRunRecord) -> StepError {
    let mut error = StepError::new(
        record
            .error_message
            .clone()
            .unwrap_or_else(|| "step failed".to_string()),
    );
    error.code = record.error_code;
    if record.error_code.is_some_and(|code| code.is_structural()) {
        error.retryable = false;
    }
    error
}

/// Run the worker loop until the drain flag appears.
///
/// Terminal task failures are routed through the manager's retry policy;
/// successful runs are acked and their results cached for idempotent
/// replay.
pub async fn run_worker(options: WorkerOptions, factory: RuntimeFactory) -> Result<(), WorkerError> {
    std::fs::create_dir_all(&options.control_dir)?;
    let clock = SystemClock;

    let queue = FileWorkQueue::open(&options.queue_dir, tm_storage::queue_file::DEFAULT_SEGMENT_MAX_BYTES)?;
    let store = IdempotencyStore::new(Some(&options.idempotency_dir), 1024, 5.0);
    let dead_letters = DeadLetterStore::new(&options.dlq_dir)?;
    let retry_policy = load_retry_policy(options.retry_config_path.as_deref())?;
    let manager = TaskQueueManager::new(queue, store, clock)
        .with_dead_letters(dead_letters)
        .with_retry_policy(retry_policy)
        .with_default_ttl(options.result_ttl_sec);

    let runtime = factory();
    let heartbeat_path = options.heartbeat_path();
    write_heartbeat(&heartbeat_path, &clock);

    let heartbeat = {
        let path = heartbeat_path.clone();
        let interval = Duration::from_millis(options.heartbeat_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                write_heartbeat(&path, &SystemClock);
            }
        })
    };

    info!(worker = %options.worker_id, queue = %options.queue_dir.display(), "worker started");
    let drain_path = options.drain_path();
    let result = worker_loop(&options, &manager, &runtime, &drain_path).await;

    heartbeat.abort();
    let _ = std::fs::remove_file(&heartbeat_path);
    // Persist the idempotency cache so a successor process serves replays
    manager.idempotency().prune();
    manager.close()?;
    info!(worker = %options.worker_id, "worker stopped");
    result
}

async fn worker_loop(
    options: &WorkerOptions,
    manager: &TaskQueueManager<FileWorkQueue, SystemClock>,
    runtime: &FlowRuntime,
    drain_path: &Path,
) -> Result<(), WorkerError> {
    loop {
        if drain_path.exists() {
            info!(worker = %options.worker_id, "drain requested, exiting");
            return Ok(());
        }

        let leases = manager.lease(options.batch_size, options.lease_ms)?;
        if leases.is_empty() {
            tokio::time::sleep(Duration::from_millis(options.poll_interval_ms)).await;
            continue;
        }

        for lease in leases {
            process_lease(options, manager, runtime, &lease).await?;
        }
    }
}

async fn process_lease(
    options: &WorkerOptions,
    manager: &TaskQueueManager<FileWorkQueue, SystemClock>,
    runtime: &FlowRuntime,
    lease: &LeasedTask,
) -> Result<(), WorkerError> {
    let envelope = &lease.envelope;
    let ctx = RunCtx {
        idempotency_key: envelope.idempotency_key().map(str::to_string),
        ..RunCtx::default()
    };
    let record = runtime
        .run(&envelope.flow_id, envelope.input.clone(), ctx, None)
        .await;

    match record.status {
        RunStatus::Ok => {
            manager.ack(lease)?;
            manager.record_result(
                envelope,
                IdempotencyResult::ok(record.output.clone()),
                options.result_ttl_sec,
            );
        }
        RunStatus::Error | RunStatus::Rejected => {
            let error = failure_from_record(&record);
            let decision = manager.handle_failure(lease, &error)?;
            info!(
                worker = %options.worker_id,
                task = %envelope.task_id,
                action = %decision.action,
                "task failed",
            );
        }
    }

    if let Some(result_log) = &options.result_log {
        append_result_line(result_log, &record, lease);
    }
    Ok(())
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
