// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker supervisor: subprocess pool with heartbeat monitoring, respawn,
//! and graceful drain.
//!
//! Per-worker state machine: spawned -> running -> (heartbeat missed ->
//! kill -> respawn) | (drain -> exit). During drain a worker finishes its
//! current lease and takes no new ones; the supervisor waits up to the
//! drain grace period, then kills laggards.

use crate::worker::DRAIN_FLAG;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tm_core::{Clock, SystemClock, WorkerId};
use tm_engine::Registry;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Errors from supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("no worker command configured and current_exe is unavailable")]
    NoWorkerCommand,
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub worker_count: usize,
    /// Base data directory: queue/, idem/, dlq/, control/ live beneath it.
    pub base_dir: PathBuf,
    pub heartbeat_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    pub drain_grace_secs: f64,
    /// Argv prefix used to spawn one worker; the worker id is appended as
    /// `--worker-id <id>`. Defaults to `<current_exe> worker --dir <base>`.
    pub worker_command: Option<Vec<String>>,
}

impl SupervisorOptions {
    pub fn new(base_dir: PathBuf, worker_count: usize) -> Self {
        Self {
            worker_count,
            base_dir,
            heartbeat_timeout_ms: 10_000,
            monitor_interval_ms: 500,
            drain_grace_secs: 10.0,
            worker_command: None,
        }
    }

    fn control_dir(&self) -> PathBuf {
        self.base_dir.join("control")
    }

    fn drain_path(&self) -> PathBuf {
        self.control_dir().join(DRAIN_FLAG)
    }

    fn heartbeat_path(&self, id: &WorkerId) -> PathBuf {
        self.control_dir().join(format!("worker-{id}.hb"))
    }

    fn worker_argv(&self) -> Result<Vec<String>, SupervisorError> {
        if let Some(argv) = &self.worker_command {
            return Ok(argv.clone());
        }
        let exe = std::env::current_exe().map_err(|_| SupervisorError::NoWorkerCommand)?;
        Ok(vec![
            exe.to_string_lossy().into_owned(),
            "worker".to_string(),
            "--dir".to_string(),
            self.base_dir.to_string_lossy().into_owned(),
        ])
    }
}

/// Externally visible worker state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub alive: bool,
    pub pid: Option<u32>,
    pub last_heartbeat_ms: Option<u64>,
    pub restarts: u32,
}

struct WorkerHandle {
    child: Child,
    restarts: u32,
}

struct SupervisorInner {
    options: SupervisorOptions,
    workers: Mutex<HashMap<WorkerId, WorkerHandle>>,
    draining: AtomicBool,
    metrics: Arc<Registry>,
    clock: SystemClock,
}

/// Process-pool supervisor over the shared file queue.
pub struct WorkerSupervisor {
    inner: Arc<SupervisorInner>,
    monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                options,
                workers: Mutex::new(HashMap::new()),
                draining: AtomicBool::new(false),
                metrics: Arc::new(Registry::new()),
                clock: SystemClock,
            }),
            monitor: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Registry>) -> Self {
        // Only callable before start; the inner Arc is not yet shared
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = metrics;
        }
        self
    }

    pub fn metrics(&self) -> Arc<Registry> {
        self.inner.metrics.clone()
    }

    /// Spawn the worker pool and the heartbeat monitor.
    pub fn start(&self) -> Result<(), SupervisorError> {
        std::fs::create_dir_all(self.inner.options.control_dir())?;
        // A stale drain flag from a previous shutdown must not stop fresh
        // workers
        let _ = std::fs::remove_file(self.inner.options.drain_path());

        for index in 0..self.inner.options.worker_count {
            let id = WorkerId::new(format!("{index}"));
            self.inner.spawn_worker(&id, 0)?;
        }
        self.inner.publish_live_gauge();

        let inner = self.inner.clone();
        let interval = Duration::from_millis(self.inner.options.monitor_interval_ms);
        *self.monitor.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                inner.monitor_tick();
            }
        }));
        Ok(())
    }

    /// Per-worker status keyed by worker id.
    pub fn status(&self) -> HashMap<String, WorkerStatus> {
        let mut workers = self.inner.workers.lock();
        workers
            .iter_mut()
            .map(|(id, handle)| {
                let alive = handle.child.try_wait().map(|e| e.is_none()).unwrap_or(false);
                (
                    id.to_string(),
                    WorkerStatus {
                        alive,
                        pid: handle.child.id(),
                        last_heartbeat_ms: self.inner.read_heartbeat(id),
                        restarts: handle.restarts,
                    },
                )
            })
            .collect()
    }

    /// Ask workers to finish their current lease and exit; kill laggards
    /// after the grace period.
    pub async fn drain(&self, grace: Duration) {
        self.inner.draining.store(true, Ordering::SeqCst);
        if let Err(e) = std::fs::write(self.inner.options.drain_path(), b"1") {
            warn!(error = %e, "failed to write drain flag");
        }
        info!(grace_secs = grace.as_secs_f64(), "draining workers");

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let all_exited = {
                let mut workers = self.inner.workers.lock();
                workers
                    .values_mut()
                    .all(|h| h.child.try_wait().map(|e| e.is_some()).unwrap_or(true))
            };
            if all_exited {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("drain grace elapsed, killing laggards");
                let mut workers = self.inner.workers.lock();
                for handle in workers.values_mut() {
                    let _ = handle.child.start_kill();
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.inner.publish_live_gauge();
    }

    /// Kill everything immediately.
    pub fn stop(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        let mut workers = self.inner.workers.lock();
        for handle in workers.values_mut() {
            let _ = handle.child.start_kill();
        }
        drop(workers);
        self.inner.publish_live_gauge();
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }
}

impl SupervisorInner {
    fn spawn_worker(&self, id: &WorkerId, restarts: u32) -> Result<(), SupervisorError> {
        let argv = self.options.worker_argv()?;
        let (program, args) = argv.split_first().ok_or(SupervisorError::NoWorkerCommand)?;

        let child = Command::new(program)
            .args(args)
            .arg("--worker-id")
            .arg(id.as_str())
            .env(crate::env::ENABLE_DAEMON_ENV, "1")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        info!(worker = %id, pid = ?child.id(), restarts, "worker spawned");
        self.workers
            .lock()
            .insert(id.clone(), WorkerHandle { child, restarts });
        Ok(())
    }

    fn read_heartbeat(&self, id: &WorkerId) -> Option<u64> {
        let raw = std::fs::read_to_string(self.options.heartbeat_path(id)).ok()?;
        raw.trim().parse().ok()
    }

    fn heartbeat_stale(&self, id: &WorkerId) -> bool {
        match self.read_heartbeat(id) {
            Some(last) => {
                self.clock.epoch_ms().saturating_sub(last) > self.options.heartbeat_timeout_ms
            }
            // No heartbeat yet: treat as fresh until the worker writes one
            None => false,
        }
    }

    /// One monitor pass: respawn dead workers, kill and respawn silent ones.
    fn monitor_tick(&self) {
        if self.draining.load(Ordering::SeqCst) {
            return;
        }
        let ids: Vec<(WorkerId, u32)> = {
            let workers = self.workers.lock();
            workers
                .iter()
                .map(|(id, handle)| (id.clone(), handle.restarts))
                .collect()
        };

        for (id, restarts) in ids {
            let exited = {
                let mut workers = self.workers.lock();
                match workers.get_mut(&id) {
                    Some(handle) => handle.child.try_wait().map(|e| e.is_some()).unwrap_or(true),
                    None => continue,
                }
            };
            let stale = !exited && self.heartbeat_stale(&id);
            if stale {
                warn!(worker = %id, "heartbeat missed, killing worker");
                let mut workers = self.workers.lock();
                if let Some(handle) = workers.get_mut(&id) {
                    let _ = handle.child.start_kill();
                }
            }
            if exited || stale {
                let _ = std::fs::remove_file(self.options.heartbeat_path(&id));
                if let Err(e) = self.spawn_worker(&id, restarts + 1) {
                    warn!(worker = %id, error = %e, "respawn failed");
                }
            }
        }
        self.publish_live_gauge();
    }

    fn publish_live_gauge(&self) {
        let mut workers = self.workers.lock();
        let mut live = 0usize;
        for h in workers.values_mut() {
            if h.child.try_wait().map(|e| e.is_none()).unwrap_or(false) {
                live += 1;
            }
        }
        self.metrics.gauge_set("tm_workers_live", &[], live as f64);
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
