// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flow specification: the step graph consumed by the runtime.
//!
//! A `FlowSpec` is an ordered mapping from step name to [`StepDef`]. The
//! first step added becomes the entrypoint unless one is set explicitly.
//! Step bodies are boxed async callables; synchronous callers are adapted
//! with the `sync_*` helpers.

use crate::canonical::content_hash;
use crate::error::StepError;
use crate::id::RunId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Step operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Task,
    Switch,
    Parallel,
    Finish,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Task => "TASK",
            Operation::Switch => "SWITCH",
            Operation::Parallel => "PARALLEL",
            Operation::Finish => "FINISH",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from spec construction and validation.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("unknown step: {0}")]
    UnknownStep(String),
    #[error("step {step} targets unresolved step {target}")]
    UnresolvedTarget { step: String, target: String },
    #[error("finish step {0} must not have successors")]
    FinishWithSuccessors(String),
    #[error("flow has no entrypoint")]
    NoEntrypoint,
}

/// Context handed to every step hook.
#[derive(Debug, Clone)]
pub struct StepCtx {
    pub flow: String,
    pub flow_id: String,
    pub run_id: RunId,
    pub step: String,
    pub step_id: String,
    pub inputs: Value,
    pub config: Value,
}

/// Boxed future returned by step hooks.
pub type HookFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Pre-execution hook.
pub type BeforeFn = Arc<dyn Fn(StepCtx) -> HookFuture<Result<(), StepError>> + Send + Sync>;
/// Step body: receives the current state, returns an object merged into it.
pub type RunFn = Arc<dyn Fn(StepCtx, Value) -> HookFuture<Result<Value, StepError>> + Send + Sync>;
/// Post-execution hook, receives the step output. Skipped when `run` fails.
pub type AfterFn = Arc<dyn Fn(StepCtx, Value) -> HookFuture<Result<(), StepError>> + Send + Sync>;
/// Failure hook, receives the step error.
pub type OnErrorFn = Arc<dyn Fn(StepCtx, StepError) -> HookFuture<()> + Send + Sync>;

/// Adapt an async closure into a [`BeforeFn`].
pub fn before_fn<F, Fut>(f: F) -> BeforeFn
where
    F: Fn(StepCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Adapt a sync closure into a [`BeforeFn`].
pub fn sync_before_fn<F>(f: F) -> BeforeFn
where
    F: Fn(StepCtx) -> Result<(), StepError> + Send + Sync + 'static,
{
    Arc::new(move |ctx| {
        let out = f(ctx);
        Box::pin(std::future::ready(out))
    })
}

/// Adapt an async closure into a [`RunFn`].
pub fn run_fn<F, Fut>(f: F) -> RunFn
where
    F: Fn(StepCtx, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    Arc::new(move |ctx, state| Box::pin(f(ctx, state)))
}

/// Adapt a sync closure into a [`RunFn`].
pub fn sync_run_fn<F>(f: F) -> RunFn
where
    F: Fn(StepCtx, Value) -> Result<Value, StepError> + Send + Sync + 'static,
{
    Arc::new(move |ctx, state| {
        let out = f(ctx, state);
        Box::pin(std::future::ready(out))
    })
}

/// Adapt an async closure into an [`AfterFn`].
pub fn after_fn<F, Fut>(f: F) -> AfterFn
where
    F: Fn(StepCtx, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    Arc::new(move |ctx, output| Box::pin(f(ctx, output)))
}

/// Adapt a sync closure into an [`AfterFn`].
pub fn sync_after_fn<F>(f: F) -> AfterFn
where
    F: Fn(StepCtx, Value) -> Result<(), StepError> + Send + Sync + 'static,
{
    Arc::new(move |ctx, output| {
        let out = f(ctx, output);
        Box::pin(std::future::ready(out))
    })
}

/// Adapt an async closure into an [`OnErrorFn`].
pub fn on_error_fn<F, Fut>(f: F) -> OnErrorFn
where
    F: Fn(StepCtx, StepError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx, err| Box::pin(f(ctx, err)))
}

/// Declarative description of an individual flow step.
#[derive(Clone)]
pub struct StepDef {
    pub name: String,
    pub operation: Operation,
    pub next_steps: Vec<String>,
    pub config: Value,
    pub before: Option<BeforeFn>,
    pub run: Option<RunFn>,
    pub after: Option<AfterFn>,
    pub on_error: Option<OnErrorFn>,
}

impl StepDef {
    pub fn new(name: impl Into<String>, operation: Operation) -> Self {
        Self {
            name: name.into(),
            operation,
            next_steps: Vec::new(),
            config: json!({}),
            before: None,
            run: None,
            after: None,
            on_error: None,
        }
    }

    pub fn with_next(mut self, next: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.next_steps = next.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_before(mut self, hook: BeforeFn) -> Self {
        self.before = Some(hook);
        self
    }

    pub fn with_run(mut self, hook: RunFn) -> Self {
        self.run = Some(hook);
        self
    }

    pub fn with_after(mut self, hook: AfterFn) -> Self {
        self.after = Some(hook);
        self
    }

    pub fn with_on_error(mut self, hook: OnErrorFn) -> Self {
        self.on_error = Some(hook);
        self
    }
}

impl fmt::Debug for StepDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDef")
            .field("name", &self.name)
            .field("operation", &self.operation)
            .field("next_steps", &self.next_steps)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// In-memory representation of a flow DAG.
#[derive(Debug, Clone, Default)]
pub struct FlowSpec {
    pub name: String,
    flow_id: String,
    entrypoint: Option<String>,
    steps: IndexMap<String, StepDef>,
}

impl FlowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            flow_id: name.clone(),
            name,
            entrypoint: None,
            steps: IndexMap::new(),
        }
    }

    /// Override the user-visible flow id (defaults to the flow name).
    pub fn with_flow_id(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = flow_id.into();
        self
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Add a step. The first step added becomes the entrypoint.
    pub fn add_step(&mut self, step: StepDef) {
        if self.entrypoint.is_none() {
            self.entrypoint = Some(step.name.clone());
        }
        self.steps.insert(step.name.clone(), step);
    }

    pub fn set_entrypoint(&mut self, name: &str) -> Result<(), SpecError> {
        if !self.steps.contains_key(name) {
            return Err(SpecError::UnknownStep(name.to_string()));
        }
        self.entrypoint = Some(name.to_string());
        Ok(())
    }

    pub fn entrypoint(&self) -> Option<&str> {
        self.entrypoint.as_deref()
    }

    pub fn step(&self, name: &str) -> Option<&StepDef> {
        self.steps.get(name)
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepDef> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn adjacency(&self) -> IndexMap<String, Vec<String>> {
        self.steps
            .iter()
            .map(|(name, step)| (name.clone(), step.next_steps.clone()))
            .collect()
    }

    /// Check structural invariants: an entrypoint exists, every target in
    /// `next_steps` resolves, and FINISH steps have no successors.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.entrypoint.is_none() {
            return Err(SpecError::NoEntrypoint);
        }
        for step in self.steps.values() {
            if step.operation == Operation::Finish && !step.next_steps.is_empty() {
                return Err(SpecError::FinishWithSuccessors(step.name.clone()));
            }
            for target in &step.next_steps {
                if !self.steps.contains_key(target) {
                    return Err(SpecError::UnresolvedTarget {
                        step: step.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Stable revision of the current structure + config.
    ///
    /// Two independently constructed specs with identical step names,
    /// operations, ordering, and configs yield the same revision; any
    /// mutation of the step set or a step config changes it.
    pub fn flow_revision(&self) -> String {
        let steps: Vec<Value> = self
            .steps
            .values()
            .map(|step| {
                json!([
                    step.name,
                    step.operation.as_str(),
                    step.next_steps,
                    step.config,
                ])
            })
            .collect();
        let digest = content_hash(&json!({
            "flow_id": self.flow_id,
            "entrypoint": self.entrypoint,
            "steps": steps,
        }));
        format!("rev-{}", &digest[..12])
    }

    /// Stable identifier for a step, identical across processes for
    /// equivalent specs.
    pub fn step_id(&self, name: &str) -> Option<String> {
        let step = self.steps.get(name)?;
        let digest = content_hash(&json!([
            self.flow_id,
            step.name,
            step.operation.as_str(),
            step.config,
        ]));
        Some(format!("step-{}", &digest[..12]))
    }
}

#[cfg(test)]
#[path = "spec_tests.rs"]
mod tests;
