// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trace spans: one record per step execution, ordered by `seq` within a run.

use crate::id::RunId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanStatus::Ok => write!(f, "ok"),
            SpanStatus::Error => write!(f, "error"),
        }
    }
}

/// One step execution record.
///
/// Within one run, `seq` is dense starting at 0 and assigned in the order
/// steps are entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSpan {
    pub flow: String,
    pub flow_id: String,
    pub flow_rev: String,
    pub run_id: RunId,
    pub step: String,
    pub step_id: String,
    pub seq: u64,
    pub t0: f64,
    pub t1: f64,
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Destination for trace spans.
///
/// Implementations must not block the runtime for more than a bounded time;
/// per-run wire order must match `seq` order.
pub trait TraceSink: Send + Sync {
    fn append(&self, span: &TraceSpan);
}

#[cfg(test)]
#[path = "trace_tests.rs"]
mod tests;
