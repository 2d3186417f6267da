// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tm-daemon: worker supervision for the TraceMind task queue.
//!
//! The supervisor spawns worker subprocesses that lease envelopes from the
//! shared file queue, execute them through a flow runtime, and record
//! outcomes. Workers heartbeat through small files in a control directory;
//! the supervisor respawns silent workers and coordinates graceful drain.

pub mod env;
pub mod supervisor;
pub mod worker;

pub use env::{daemon_enabled, ENABLE_DAEMON_ENV};
pub use supervisor::{SupervisorError, SupervisorOptions, WorkerStatus, WorkerSupervisor};
pub use worker::{run_worker, RuntimeFactory, WorkerError, WorkerOptions};
