// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Correlation hub: bridges deferred runs with their later-arriving
//! completion signals.
//!
//! Two registries live here: token -> (flow, payload) for reserved deferred
//! runs, and request id -> payload for completion signals. Both are safe
//! under concurrent access from the runtime and step hooks.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct HubInner {
    pending: HashMap<String, (String, Value)>,
    signals: HashMap<String, Value>,
}

/// In-process token and signal registry for deferred executions.
#[derive(Default)]
pub struct CorrelationHub {
    inner: Mutex<HubInner>,
}

impl CorrelationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a token for a deferred run of `flow` with its payload.
    pub fn reserve(&self, flow: &str, payload: Value) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.inner
            .lock()
            .pending
            .insert(token.clone(), (flow.to_string(), payload));
        token
    }

    /// Look up a reservation without consuming it.
    pub fn resolve(&self, token: &str) -> Option<(String, Value)> {
        self.inner.lock().pending.get(token).cloned()
    }

    /// Redeem a reservation, removing it.
    pub fn consume(&self, token: &str) -> Option<(String, Value)> {
        self.inner.lock().pending.remove(token)
    }

    /// Record a completion signal for a request id.
    pub fn signal(&self, req_id: &str, payload: Value) {
        self.inner.lock().signals.insert(req_id.to_string(), payload);
    }

    /// Take the signal for a request id, if one has arrived.
    pub fn consume_signal(&self, req_id: &str) -> Option<Value> {
        self.inner.lock().signals.remove(req_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

#[cfg(test)]
#[path = "correlate_tests.rs"]
mod tests;
