// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry schedule: per-flow exponential backoff with jitter and a DLQ
//! threshold.

use crate::error::StepError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Upper bound applied to computed backoff delays.
const MAX_DELAY_MS: f64 = 60_000.0;

/// Backoff settings for one flow (or the default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_ms: f64,
    pub factor: f64,
    pub jitter_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dlq_after: Option<u32>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 200.0,
            factor: 2.0,
            jitter_ms: 100.0,
            dlq_after: None,
        }
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    Retry,
    Dlq,
}

impl fmt::Display for RetryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryAction::Retry => write!(f, "retry"),
            RetryAction::Dlq => write!(f, "dlq"),
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    pub action: RetryAction,
    pub delay_seconds: f64,
}

impl RetryDecision {
    fn dlq() -> Self {
        Self {
            action: RetryAction::Dlq,
            delay_seconds: 0.0,
        }
    }
}

/// Config file shape consumed by workers: a `retries` table with a
/// `default` entry plus per-flow overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub retries: RetryTable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryTable {
    #[serde(default)]
    pub default: RetrySettings,
    #[serde(flatten)]
    pub flows: HashMap<String, RetrySettings>,
}

/// Per-flow backoff schedule.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    default: RetrySettings,
    per_flow: HashMap<String, RetrySettings>,
}

impl RetryPolicy {
    pub fn new(default: RetrySettings, per_flow: HashMap<String, RetrySettings>) -> Self {
        Self { default, per_flow }
    }

    pub fn from_config(config: RetryConfig) -> Self {
        Self {
            default: config.retries.default,
            per_flow: config.retries.flows,
        }
    }

    fn settings(&self, flow_id: &str) -> &RetrySettings {
        self.per_flow.get(flow_id).unwrap_or(&self.default)
    }

    /// Decide whether the given failed attempt is retried or dead-lettered.
    ///
    /// `attempt` counts completed attempts, so `attempt + 1 >= max_attempts`
    /// means the next execution would exceed the budget.
    pub fn decide(&self, flow_id: &str, attempt: u32, error: &StepError) -> RetryDecision {
        let settings = self.settings(flow_id);
        if !error.retryable {
            return RetryDecision::dlq();
        }
        if attempt + 1 >= settings.max_attempts {
            return RetryDecision::dlq();
        }
        if let Some(dlq_after) = settings.dlq_after {
            if attempt + 1 >= dlq_after {
                return RetryDecision::dlq();
            }
        }

        let backoff = settings.base_ms * settings.factor.powi(attempt as i32);
        let jitter = if settings.jitter_ms > 0.0 {
            rand::random_range(0.0..settings.jitter_ms)
        } else {
            0.0
        };
        let delay_ms = (backoff + jitter).min(MAX_DELAY_MS);
        RetryDecision {
            action: RetryAction::Retry,
            delay_seconds: delay_ms / 1000.0,
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
