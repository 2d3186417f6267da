// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-visible error codes and step failure type.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable error codes surfaced in run results, trace spans, and DLQ records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    QueueFull,
    QueueTimeout,
    DeferredDisabled,
    SwitchNoMatch,
    Cancelled,
    Timeout,
    IdempotentReplay,
    PolicyForbidden,
    GuardBlocked,
    RateLimited,
    MissingStep,
    InvalidSpec,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::QueueTimeout => "QUEUE_TIMEOUT",
            ErrorCode::DeferredDisabled => "DEFERRED_DISABLED",
            ErrorCode::SwitchNoMatch => "SWITCH_NO_MATCH",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::IdempotentReplay => "IDEMPOTENT_REPLAY",
            ErrorCode::PolicyForbidden => "POLICY_FORBIDDEN",
            ErrorCode::GuardBlocked => "GUARD_BLOCKED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::MissingStep => "MISSING_STEP",
            ErrorCode::InvalidSpec => "INVALID_SPEC",
        }
    }

    /// Structural errors must never be retried by the queue manager.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ErrorCode::SwitchNoMatch | ErrorCode::MissingStep | ErrorCode::InvalidSpec
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a step hook or synthesized by the runtime.
///
/// `retryable` travels with the failure so the queue manager's retry policy
/// can distinguish transient errors from permanent ones without inspecting
/// the message.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct StepError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: !code.is_structural(),
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn code_str(&self) -> Option<&'static str> {
        self.code.map(|c| c.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
