// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flow execution policies.

use serde::{Deserialize, Serialize};

/// How `run` responds: inline result or deferred token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseMode {
    Immediate,
    Deferred,
}

/// Per-runtime execution policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPolicies {
    pub response_mode: ResponseMode,
    pub allow_deferred: bool,
    /// Poll window for an already-signaled deferred result, in seconds.
    pub short_wait_s: f64,
}

impl Default for FlowPolicies {
    fn default() -> Self {
        Self {
            response_mode: ResponseMode::Immediate,
            allow_deferred: false,
            short_wait_s: 0.0,
        }
    }
}
