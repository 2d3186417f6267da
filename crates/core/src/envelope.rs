// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task envelope: the serializable unit handed between producers, the
//! queue, and workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Header key carrying the caller-supplied idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "idempotency_key";

/// A queued unit of work for one flow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub flow_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub trace: Value,
    #[serde(default)]
    pub attempt: u32,
    pub created_ts: f64,
}

impl TaskEnvelope {
    /// Build a fresh envelope with a random task id and attempt 0.
    pub fn new(
        flow_id: impl Into<String>,
        input: Value,
        headers: Option<HashMap<String, String>>,
        trace: Option<Value>,
        created_ts: f64,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().simple().to_string(),
            flow_id: flow_id.into(),
            input,
            headers: headers.unwrap_or_default(),
            trace: trace.unwrap_or(Value::Null),
            attempt: 0,
            created_ts,
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.headers.get(IDEMPOTENCY_HEADER).map(String::as_str)
    }

    /// Deduplication key: the idempotency key when present, else the task id.
    pub fn composite_key(&self) -> &str {
        self.idempotency_key().unwrap_or(&self.task_id)
    }

    /// Canonical JSON record for on-wire and on-disk framing.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
