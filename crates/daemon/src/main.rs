// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TraceMind daemon (tmd)
//!
//! Subcommands:
//! - `tmd supervise --dir <base> [--workers N]`: run the worker supervisor
//!   over the file queue rooted at `<base>`.
//! - `tmd worker --dir <base> [--worker-id ID]`: run one worker loop
//!   (normally spawned by the supervisor).
//!
//! Both require `TM_ENABLE_DAEMON=1`.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tm_core::{sync_run_fn, FlowSpec, Operation, StepDef, WorkerId};
use tm_daemon::{
    daemon_enabled, run_worker, RuntimeFactory, SupervisorOptions, WorkerOptions, WorkerSupervisor,
    ENABLE_DAEMON_ENV,
};
use tm_engine::{FlowRuntime, RuntimeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!("tmd {}", env!("CARGO_PKG_VERSION"));
    println!("TraceMind daemon - worker supervision over the durable task queue");
    println!();
    println!("USAGE:");
    println!("    tmd supervise --dir <base> [--workers N] [--drain-grace SECS]");
    println!("    tmd worker --dir <base> [--worker-id ID] [--result-log PATH] [--retry-config PATH]");
    println!();
    println!("Requires TM_ENABLE_DAEMON=1.");
}

struct Args {
    values: Vec<String>,
}

impl Args {
    fn flag_value(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .position(|a| a == name)
            .and_then(|i| self.values.get(i + 1))
            .map(String::as_str)
    }
}

fn default_factory() -> RuntimeFactory {
    Arc::new(|| {
        let runtime = FlowRuntime::new(RuntimeConfig::default());
        // Built-in passthrough flow; embedders supply richer registries
        // through the library API
        let mut spec = FlowSpec::new("echo");
        spec.add_step(
            StepDef::new("start", Operation::Task)
                .with_run(sync_run_fn(|_ctx, state| Ok(state))),
        );
        runtime.register(spec);
        runtime
    })
}

async fn supervise(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let base_dir = PathBuf::from(args.flag_value("--dir").unwrap_or("./tracemind"));
    let workers: usize = args
        .flag_value("--workers")
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    let drain_grace: f64 = args
        .flag_value("--drain-grace")
        .and_then(|v| v.parse().ok())
        .unwrap_or(10.0);

    let mut options = SupervisorOptions::new(base_dir, workers);
    options.drain_grace_secs = drain_grace;
    let grace = Duration::from_secs_f64(options.drain_grace_secs);

    let supervisor = WorkerSupervisor::new(options);
    supervisor.start()?;
    info!(workers, "supervisor started");

    wait_for_shutdown().await?;
    info!("shutdown signal received, draining workers");
    supervisor.drain(grace).await;
    supervisor.stop();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

async fn worker(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let base_dir = PathBuf::from(args.flag_value("--dir").unwrap_or("./tracemind"));
    let worker_id = WorkerId::new(args.flag_value("--worker-id").unwrap_or("0"));

    let mut options = WorkerOptions::new(&base_dir, worker_id);
    options.result_log = args.flag_value("--result-log").map(PathBuf::from);
    options.retry_config_path = args.flag_value("--retry-config").map(PathBuf::from);

    run_worker(options, default_factory()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let values: Vec<String> = std::env::args().skip(1).collect();
    let command = values.first().cloned();
    let args = Args { values };

    match command.as_deref() {
        Some("--help" | "-h" | "help") | None => {
            print_help();
            return Ok(());
        }
        Some("--version" | "-V") => {
            println!("tmd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("supervise" | "worker") => {}
        Some(other) => {
            eprintln!("error: unexpected argument '{other}'");
            eprintln!("Usage: tmd [supervise | worker | --help | --version]");
            std::process::exit(1);
        }
    }

    if !daemon_enabled() {
        eprintln!("error: daemon subcommands require {ENABLE_DAEMON_ENV}=1");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match command.as_deref() {
        Some("supervise") => supervise(&args).await,
        Some("worker") => worker(&args).await,
        _ => Ok(()),
    }
}
