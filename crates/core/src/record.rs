// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Immutable per-run result record.

use crate::error::ErrorCode;
use crate::id::RunId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Terminal status of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    Rejected,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "ok"),
            RunStatus::Error => write!(f, "error"),
            RunStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Record produced for every `run` call, accepted or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunRecord {
    pub flow: String,
    pub flow_id: String,
    pub flow_rev: String,
    pub run_id: RunId,
    pub status: RunStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Time spent in the admission queue.
    pub queued_ms: f64,
    /// Time spent walking the DAG.
    pub exec_ms: f64,
    pub duration_ms: f64,
    pub start_ts: f64,
    pub end_ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

impl FlowRunRecord {
    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }

    pub fn error_code_str(&self) -> Option<&'static str> {
        self.error_code.map(|c| c.as_str())
    }
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
