// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Governance surface: pre-run and per-step gating consumed by the runtime.
//!
//! The runtime only depends on the [`Governance`] trait. The bundled
//! [`GovernanceManager`] implements guard rules over request payloads and
//! per-scope rate limits; richer policy engines plug in behind the same
//! trait.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tm_core::{Clock, ErrorCode, SystemClock};

/// Admission refusal: the run is rejected before any step executes.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Gating hooks invoked by the runtime.
pub trait Governance: Send + Sync {
    /// Called before admission; a rejection fails the run with
    /// `status="rejected"` and no trace spans.
    fn check_run(&self, flow: &str, inputs: &Value) -> Result<(), Rejection>;

    /// Called before each step enters. Default allows everything.
    fn check_step(&self, _flow: &str, _step: &str) -> Result<(), Rejection> {
        Ok(())
    }
}

/// One guard rule evaluated against request inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardRule {
    /// Rule kind; `length_max` is the only built-in.
    #[serde(rename = "type")]
    pub rule_type: String,
    /// JSON path of the checked field, e.g. `$.text`.
    pub path: String,
    pub value: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<GuardRule>,
}

/// Rate limit settings for one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    pub enabled: bool,
    pub qps: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub enabled: bool,
    #[serde(default)]
    pub global_scope: Option<LimitSettings>,
    #[serde(default)]
    pub per_flow: HashMap<String, LimitSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfig {
    pub enabled: bool,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Config-driven governance: guard rules plus per-scope QPS limits.
pub struct GovernanceManager<C: Clock = SystemClock> {
    config: GovernanceConfig,
    clock: C,
    /// Last allowed request per scope, in epoch ms.
    last_allowed: Mutex<HashMap<String, u64>>,
}

impl GovernanceManager<SystemClock> {
    pub fn new(config: GovernanceConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> GovernanceManager<C> {
    pub fn with_clock(config: GovernanceConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            last_allowed: Mutex::new(HashMap::new()),
        }
    }

    fn check_guard(&self, inputs: &Value) -> Result<(), Rejection> {
        if !self.config.guard.enabled {
            return Ok(());
        }
        for rule in &self.config.guard.rules {
            if rule.rule_type != "length_max" {
                continue;
            }
            let Some(field) = resolve_path(inputs, &rule.path) else {
                continue;
            };
            let length = match field {
                Value::String(s) => s.chars().count() as u64,
                Value::Array(items) => items.len() as u64,
                _ => continue,
            };
            if length > rule.value {
                return Err(Rejection::new(
                    ErrorCode::GuardBlocked,
                    format!("{} exceeds length_max {}", rule.path, rule.value),
                ));
            }
        }
        Ok(())
    }

    fn check_limit(&self, scope: &str, settings: &LimitSettings) -> Result<(), Rejection> {
        if !settings.enabled || settings.qps <= 0.0 {
            return Ok(());
        }
        let interval_ms = (1000.0 / settings.qps) as u64;
        let now = self.clock.epoch_ms();
        let mut last_allowed = self.last_allowed.lock();
        match last_allowed.get(scope) {
            Some(last) if now.saturating_sub(*last) < interval_ms => Err(Rejection::new(
                ErrorCode::RateLimited,
                format!("rate limit exceeded for scope {scope}"),
            )),
            _ => {
                last_allowed.insert(scope.to_string(), now);
                Ok(())
            }
        }
    }

    fn check_limits(&self, flow: &str) -> Result<(), Rejection> {
        if !self.config.limits.enabled {
            return Ok(());
        }
        if let Some(global) = &self.config.limits.global_scope {
            self.check_limit("global", global)?;
        }
        if let Some(settings) = self.config.limits.per_flow.get(flow) {
            self.check_limit(flow, settings)?;
        }
        Ok(())
    }
}

impl<C: Clock> Governance for GovernanceManager<C> {
    fn check_run(&self, flow: &str, inputs: &Value) -> Result<(), Rejection> {
        if !self.config.enabled {
            return Ok(());
        }
        self.check_guard(inputs)?;
        self.check_limits(flow)
    }
}

/// Resolve a `$.a.b` style path against a JSON value.
fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.strip_prefix("$.")?;
    let mut current = value;
    for segment in trimmed.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
#[path = "governance_tests.rs"]
mod tests;
