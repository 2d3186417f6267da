// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tm-engine: the TraceMind flow runtime and task queue coordination.

pub mod correlate;
pub mod governance;
pub mod manager;
pub mod metrics;
pub mod policies;
pub mod runtime;
pub mod trace_sink;

pub use correlate::CorrelationHub;
pub use governance::{
    Governance, GovernanceConfig, GovernanceManager, GuardConfig, GuardRule, LimitSettings,
    LimitsConfig, Rejection,
};
pub use manager::{EnqueueOutcome, ManagerError, TaskQueueManager};
pub use metrics::{MetricsSnapshot, Registry};
pub use policies::{FlowPolicies, ResponseMode};
pub use runtime::{
    run_listener, CancelToken, FlowRuntime, RunCtx, RunListener, RuntimeConfig, RuntimeStats,
};
pub use trace_sink::FlowTraceSink;
