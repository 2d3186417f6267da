// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flow runtime: admission, DAG walk, lifecycle hooks, deferred handoff,
//! idempotency, and trace emission.
//!
//! Every `run` call produces a [`FlowRunRecord`], including rejections.
//! Admission is a bounded ticket queue in front of a FIFO semaphore:
//! when all permits are taken and the queue is at capacity the call fails
//! fast with `QUEUE_FULL`. Accepted runs walk the step graph, invoking
//! hooks in `before -> run -> after` order (`on_error` instead of `after`
//! on failure) and emitting one trace span per step with a dense `seq`.

use crate::correlate::CorrelationHub;
use crate::governance::Governance;
use crate::policies::{FlowPolicies, ResponseMode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tm_core::{
    Clock, ErrorCode, FlowRunRecord, FlowSpec, HookFuture, Operation, RunId, RunStatus, SpanStatus,
    StepCtx, StepDef, StepError, SystemClock, TraceSink, TraceSpan,
};
use tm_storage::{IdempotencyResult, IdempotencyStore};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Runtime configuration; see the config knob table in the crate docs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_concurrency: usize,
    pub queue_capacity: usize,
    pub queue_wait_timeout_ms: Option<u64>,
    pub idempotency_ttl_sec: f64,
    pub idempotency_cache_size: usize,
    pub policies: FlowPolicies,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 100,
            queue_capacity: 300,
            queue_wait_timeout_ms: None,
            idempotency_ttl_sec: 0.0,
            idempotency_cache_size: 1024,
            policies: FlowPolicies::default(),
        }
    }
}

/// Cooperative cancellation handle for a run.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call context.
#[derive(Debug, Clone, Default)]
pub struct RunCtx {
    pub idempotency_key: Option<String>,
    /// Whole-run deadline; expiry aborts at the next suspension point.
    pub timeout_ms: Option<u64>,
    pub cancel: Option<CancelToken>,
}

/// Callback awaited with every produced run record.
pub type RunListener = Arc<dyn Fn(FlowRunRecord) -> HookFuture<()> + Send + Sync>;

/// Adapt an async closure into a [`RunListener`].
pub fn run_listener<F, Fut>(f: F) -> RunListener
where
    F: Fn(FlowRunRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |record| Box::pin(f(record)))
}

/// Point-in-time runtime counters.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    pub active_peak: usize,
    pub queue_depth_peak: usize,
    pub rejected_reason: HashMap<String, u64>,
    pub exec_ms_p50: f64,
}

const EXEC_SAMPLE_CAP: usize = 4096;

#[derive(Default)]
struct StatsInner {
    active: usize,
    active_peak: usize,
    queue_depth: usize,
    queue_depth_peak: usize,
    rejected_reason: HashMap<String, u64>,
    exec_samples: Vec<f64>,
    exec_total: usize,
}

/// Per-run span sequencing; appending under the lock keeps wire order
/// identical to `seq` order even across parallel branches.
struct SpanRecorder {
    flow: String,
    flow_id: String,
    flow_rev: String,
    run_id: RunId,
    next_seq: Mutex<u64>,
    sink: Option<Arc<dyn TraceSink>>,
}

impl SpanRecorder {
    fn emit(&self, step: &str, step_id: &str, t0: f64, t1: f64, error: Option<&StepError>) {
        let mut next_seq = self.next_seq.lock();
        let span = TraceSpan {
            flow: self.flow.clone(),
            flow_id: self.flow_id.clone(),
            flow_rev: self.flow_rev.clone(),
            run_id: self.run_id.clone(),
            step: step.to_string(),
            step_id: step_id.to_string(),
            seq: *next_seq,
            t0,
            t1,
            status: if error.is_some() {
                SpanStatus::Error
            } else {
                SpanStatus::Ok
            },
            error_code: error.and_then(StepError::code_str).map(String::from),
            error_message: error.map(|e| e.message.clone()),
        };
        *next_seq += 1;
        // Appending inside the sequence lock keeps wire order equal to
        // seq order across parallel branches
        if let Some(sink) = &self.sink {
            sink.append(&span);
        }
    }
}

struct WalkShared<C: Clock + Clone + 'static> {
    spec: Arc<FlowSpec>,
    inputs: Value,
    run_id: RunId,
    clock: C,
    recorder: SpanRecorder,
    governance: Option<Arc<dyn Governance>>,
    cancel: Option<CancelToken>,
    deadline: Option<tokio::time::Instant>,
}

struct WalkOutcome {
    state: Value,
    executed: Vec<String>,
}

/// Executes registered flows under admission and concurrency limits.
pub struct FlowRuntime<C: Clock + Clone + 'static = SystemClock> {
    flows: Mutex<HashMap<String, Arc<FlowSpec>>>,
    config: RuntimeConfig,
    clock: C,
    semaphore: Arc<Semaphore>,
    stats: Mutex<StatsInner>,
    idempotency: IdempotencyStore<C>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<FlowRunRecord>>>>,
    correlator: Arc<CorrelationHub>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    governance: Option<Arc<dyn Governance>>,
    run_listeners: Vec<RunListener>,
}

impl FlowRuntime<SystemClock> {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock + Clone + 'static> FlowRuntime<C> {
    pub fn with_clock(config: RuntimeConfig, clock: C) -> Self {
        let idempotency = IdempotencyStore::with_clock(
            None,
            config.idempotency_cache_size,
            60.0,
            clock.clone(),
        );
        Self {
            flows: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            clock,
            stats: Mutex::new(StatsInner::default()),
            idempotency,
            inflight: Mutex::new(HashMap::new()),
            correlator: Arc::new(CorrelationHub::new()),
            trace_sink: None,
            governance: None,
            run_listeners: Vec::new(),
        }
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn with_governance(mut self, governance: Arc<dyn Governance>) -> Self {
        self.governance = Some(governance);
        self
    }

    pub fn with_correlator(mut self, correlator: Arc<CorrelationHub>) -> Self {
        self.correlator = correlator;
        self
    }

    pub fn with_run_listener(mut self, listener: RunListener) -> Self {
        self.run_listeners.push(listener);
        self
    }

    /// Register a flow; later registrations with the same name replace
    /// earlier ones.
    pub fn register(&self, spec: FlowSpec) {
        self.flows.lock().insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn correlator(&self) -> Arc<CorrelationHub> {
        self.correlator.clone()
    }

    pub fn stats(&self) -> RuntimeStats {
        let inner = self.stats.lock();
        let mut sorted = inner.exec_samples.clone();
        sorted.sort_by(f64::total_cmp);
        let exec_ms_p50 = if sorted.is_empty() {
            0.0
        } else {
            sorted[sorted.len() / 2]
        };
        RuntimeStats {
            active_peak: inner.active_peak,
            queue_depth_peak: inner.queue_depth_peak,
            rejected_reason: inner.rejected_reason.clone(),
            exec_ms_p50,
        }
    }

    /// Execute `name` to completion (or deferred-pending) and return its
    /// run record.
    pub async fn run(
        &self,
        name: &str,
        inputs: Value,
        ctx: RunCtx,
        response_mode: Option<ResponseMode>,
    ) -> FlowRunRecord {
        let start_ts = self.clock.epoch_s();
        let run_id = RunId::generate();

        let spec = self.flows.lock().get(name).cloned();
        let Some(spec) = spec else {
            let record = self.make_record(
                name,
                name,
                "",
                run_id,
                start_ts,
                RunStatus::Error,
                Value::Null,
                Some(ErrorCode::MissingStep),
                Some(format!("unknown flow: {name}")),
                0.0,
                0.0,
            );
            return self.complete(record).await;
        };
        let flow_rev = spec.flow_revision();

        if let Some(governance) = &self.governance {
            if let Err(rejection) = governance.check_run(name, &inputs) {
                let record = self.rejected_record(
                    &spec,
                    &flow_rev,
                    run_id,
                    start_ts,
                    rejection.code,
                    rejection.message,
                );
                return self.complete(record).await;
            }
        }

        let mode = response_mode.unwrap_or(self.config.policies.response_mode);
        if mode == ResponseMode::Deferred {
            return self.run_deferred(spec, flow_rev, run_id, inputs, ctx, start_ts).await;
        }

        // Idempotency pre-check: a live cached entry short-circuits; an
        // identical in-flight key joins the existing run.
        let mut winner: Option<(String, watch::Sender<Option<FlowRunRecord>>)> = None;
        if let Some(key) = ctx.idempotency_key.clone() {
            if let Some(record) = self.join_or_claim(&spec, &flow_rev, &key, &mut winner).await {
                return record;
            }
        }

        let record = self
            .admit_and_walk(spec, flow_rev, run_id, inputs, ctx, start_ts)
            .await;

        if let Some((key, tx)) = winner {
            if record.status == RunStatus::Ok && self.config.idempotency_ttl_sec > 0.0 {
                self.idempotency.remember(
                    &key,
                    IdempotencyResult::ok(record.output.clone()),
                    self.config.idempotency_ttl_sec,
                );
            }
            self.inflight.lock().remove(&key);
            let _ = tx.send(Some(record.clone()));
        }

        self.complete(record).await
    }

    /// Resolve an idempotency key: return a replay/joined record, or claim
    /// the key for this call (populating `winner`).
    async fn join_or_claim(
        &self,
        spec: &FlowSpec,
        flow_rev: &str,
        key: &str,
        winner: &mut Option<(String, watch::Sender<Option<FlowRunRecord>>)>,
    ) -> Option<FlowRunRecord> {
        if let Some(cached) = self.idempotency.get(key) {
            let record = self.make_record(
                &spec.name,
                spec.flow_id(),
                flow_rev,
                RunId::generate(),
                self.clock.epoch_s(),
                if cached.status == "ok" {
                    RunStatus::Ok
                } else {
                    RunStatus::Error
                },
                cached.output,
                Some(ErrorCode::IdempotentReplay),
                None,
                0.0,
                0.0,
            );
            return Some(self.complete(record).await);
        }

        let rx = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(rx) => Some(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    *winner = Some((key.to_string(), tx));
                    None
                }
            }
        };

        let mut rx = rx?;
        loop {
            let settled = rx.borrow_and_update().clone();
            if let Some(record) = settled {
                return Some(self.complete(record).await);
            }
            if rx.changed().await.is_err() {
                // Winner dropped without settling; clear the stale claim so
                // later calls can execute
                self.inflight.lock().remove(key);
                let record = self.make_record(
                    &spec.name,
                    spec.flow_id(),
                    flow_rev,
                    RunId::generate(),
                    self.clock.epoch_s(),
                    RunStatus::Error,
                    Value::Null,
                    None,
                    Some(format!("in-flight run for key {key} aborted")),
                    0.0,
                    0.0,
                );
                return Some(self.complete(record).await);
            }
        }
    }

    async fn admit_and_walk(
        &self,
        spec: Arc<FlowSpec>,
        flow_rev: String,
        run_id: RunId,
        inputs: Value,
        ctx: RunCtx,
        start_ts: f64,
    ) -> FlowRunRecord {
        let (permit, queued_ms) = match self.admit().await {
            Ok(admitted) => admitted,
            Err((code, message)) => {
                return self.rejected_record(&spec, &flow_rev, run_id, start_ts, code, message);
            }
        };

        let deadline = ctx
            .timeout_ms
            .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
        let shared = Arc::new(WalkShared {
            recorder: SpanRecorder {
                flow: spec.name.clone(),
                flow_id: spec.flow_id().to_string(),
                flow_rev: flow_rev.clone(),
                run_id: run_id.clone(),
                next_seq: Mutex::new(0),
                sink: self.trace_sink.clone(),
            },
            inputs: inputs.clone(),
            run_id: run_id.clone(),
            clock: self.clock.clone(),
            governance: self.governance.clone(),
            cancel: ctx.cancel.clone(),
            deadline,
            spec: spec.clone(),
        });

        let entrypoint = shared.spec.entrypoint().map(str::to_string);
        let exec_start = Instant::now();
        // A stepless flow completes trivially (deferred handoff specs)
        let outcome = match entrypoint {
            Some(entrypoint) => walk_flow(shared, entrypoint, inputs.clone()).await,
            None => Ok(WalkOutcome {
                state: inputs.clone(),
                executed: Vec::new(),
            }),
        };
        let exec_ms = exec_start.elapsed().as_secs_f64() * 1000.0;

        let record = match outcome {
            Ok(walked) => self.make_record(
                &spec.name,
                spec.flow_id(),
                &flow_rev,
                run_id,
                start_ts,
                RunStatus::Ok,
                json!({
                    "inputs": inputs,
                    "steps": walked.executed,
                    "state": walked.state,
                }),
                None,
                None,
                queued_ms,
                exec_ms,
            ),
            Err(err) => self.make_record(
                &spec.name,
                spec.flow_id(),
                &flow_rev,
                run_id,
                start_ts,
                RunStatus::Error,
                Value::Null,
                err.code,
                Some(err.message),
                queued_ms,
                exec_ms,
            ),
        };

        {
            let mut stats = self.stats.lock();
            stats.active -= 1;
            if stats.exec_samples.len() < EXEC_SAMPLE_CAP {
                stats.exec_samples.push(exec_ms);
            } else {
                let slot = stats.exec_total % EXEC_SAMPLE_CAP;
                stats.exec_samples[slot] = exec_ms;
            }
            stats.exec_total += 1;
        }
        drop(permit);
        record
    }

    /// Deferred response mode: reserve a correlation token and hand back a
    /// pending (or already-ready) result envelope.
    async fn run_deferred(
        &self,
        spec: Arc<FlowSpec>,
        flow_rev: String,
        run_id: RunId,
        inputs: Value,
        ctx: RunCtx,
        start_ts: f64,
    ) -> FlowRunRecord {
        if !self.config.policies.allow_deferred {
            let record = self.make_record(
                &spec.name,
                spec.flow_id(),
                &flow_rev,
                run_id,
                start_ts,
                RunStatus::Error,
                Value::Null,
                Some(ErrorCode::DeferredDisabled),
                Some("deferred execution is disabled by policy".to_string()),
                0.0,
                0.0,
            );
            return self.complete(record).await;
        }

        let token = self.correlator.reserve(&spec.name, inputs.clone());
        let req_id = inputs
            .get("req_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut ready = None;
        if let Some(req_id) = &req_id {
            ready = self.correlator.consume_signal(req_id);
            let wait_s = self.config.policies.short_wait_s.max(0.0);
            if ready.is_none() && wait_s > 0.0 {
                let deadline = Instant::now() + Duration::from_secs_f64(wait_s);
                while ready.is_none() && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    ready = self.correlator.consume_signal(req_id);
                }
            }
        }

        if let Some(result) = ready {
            self.correlator.consume(&token);
            debug!(flow = %spec.name, token = %token, "deferred run resolved by signal");
            let record = self.make_record(
                &spec.name,
                spec.flow_id(),
                &flow_rev,
                run_id,
                start_ts,
                RunStatus::Ok,
                json!({
                    "status": "ready",
                    "token": token,
                    "flow": spec.name,
                    "result": result,
                }),
                None,
                None,
                0.0,
                0.0,
            );
            return self.complete(record).await;
        }

        let flow = spec.name.clone();
        let mut record = self
            .admit_and_walk(spec, flow_rev, run_id, inputs, ctx, start_ts)
            .await;
        if record.status == RunStatus::Ok {
            record.output = json!({
                "status": "pending",
                "token": token,
                "flow": flow,
            });
        }
        self.complete(record).await
    }

    /// Bounded admission: fail fast when the semaphore is exhausted and the
    /// ticket queue is full, otherwise wait FIFO for a permit.
    async fn admit(&self) -> Result<(OwnedSemaphorePermit, f64), (ErrorCode, String)> {
        {
            let mut stats = self.stats.lock();
            if self.semaphore.available_permits() == 0
                && stats.queue_depth >= self.config.queue_capacity
            {
                return Err((
                    ErrorCode::QueueFull,
                    "admission queue at capacity".to_string(),
                ));
            }
            stats.queue_depth += 1;
            stats.queue_depth_peak = stats.queue_depth_peak.max(stats.queue_depth);
        }

        let waited = Instant::now();
        let acquired = match self.config.queue_wait_timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(ms),
                    self.semaphore.clone().acquire_owned(),
                )
                .await
                {
                    Ok(result) => result.ok(),
                    Err(_) => None,
                }
            }
            None => self.semaphore.clone().acquire_owned().await.ok(),
        };

        let mut stats = self.stats.lock();
        stats.queue_depth -= 1;
        match acquired {
            Some(permit) => {
                stats.active += 1;
                stats.active_peak = stats.active_peak.max(stats.active);
                Ok((permit, waited.elapsed().as_secs_f64() * 1000.0))
            }
            None => Err((
                ErrorCode::QueueTimeout,
                "admission queue wait timed out".to_string(),
            )),
        }
    }

    fn rejected_record(
        &self,
        spec: &FlowSpec,
        flow_rev: &str,
        run_id: RunId,
        start_ts: f64,
        code: ErrorCode,
        message: String,
    ) -> FlowRunRecord {
        self.make_record(
            &spec.name,
            spec.flow_id(),
            flow_rev,
            run_id,
            start_ts,
            RunStatus::Rejected,
            Value::Null,
            Some(code),
            Some(message),
            0.0,
            0.0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn make_record(
        &self,
        flow: &str,
        flow_id: &str,
        flow_rev: &str,
        run_id: RunId,
        start_ts: f64,
        status: RunStatus,
        output: Value,
        error_code: Option<ErrorCode>,
        error_message: Option<String>,
        queued_ms: f64,
        exec_ms: f64,
    ) -> FlowRunRecord {
        let end_ts = self.clock.epoch_s();
        FlowRunRecord {
            flow: flow.to_string(),
            flow_id: flow_id.to_string(),
            flow_rev: flow_rev.to_string(),
            run_id,
            status,
            output,
            error_code,
            error_message,
            queued_ms,
            exec_ms,
            duration_ms: (end_ts - start_ts) * 1000.0,
            start_ts,
            end_ts,
            selected_flow: None,
            binding: None,
            cost_usd: None,
            user_rating: None,
            reward: None,
            meta: Value::Null,
        }
    }

    /// Final bookkeeping for every produced record: rejection stats and
    /// run listeners (awaited).
    async fn complete(&self, record: FlowRunRecord) -> FlowRunRecord {
        if record.status == RunStatus::Rejected {
            if let Some(code) = record.error_code {
                let mut stats = self.stats.lock();
                *stats
                    .rejected_reason
                    .entry(code.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }
        for listener in &self.run_listeners {
            listener(record.clone()).await;
        }
        record
    }
}

/// Race a hook future against cancellation and the run deadline.
async fn guarded<C, T>(shared: &WalkShared<C>, fut: impl Future<Output = T>) -> Result<T, StepError>
where
    C: Clock + Clone + 'static,
{
    let cancel_fut = async {
        match &shared.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };
    let deadline_fut = async {
        match shared.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel_fut => Err(StepError::with_code(ErrorCode::Cancelled, "run cancelled")),
        _ = deadline_fut => Err(StepError::with_code(ErrorCode::Timeout, "run deadline exceeded")),
        out = fut => Ok(out),
    }
}

/// Shallow-merge an object output into the run state.
fn merge_state(state: &mut Value, output: &Value) {
    let Some(updates) = output.as_object() else {
        return;
    };
    match state.as_object_mut() {
        Some(map) => {
            for (key, value) in updates {
                map.insert(key.clone(), value.clone());
            }
        }
        None => *state = output.clone(),
    }
}

/// Resolve a SWITCH step's successor.
///
/// `config.key` is matched literally against `next_steps`; run state never
/// influences routing.
fn resolve_switch(step: &StepDef) -> Result<Option<String>, StepError> {
    if let Some(key) = step.config.get("key").and_then(Value::as_str) {
        if step.next_steps.iter().any(|n| n == key) {
            return Ok(Some(key.to_string()));
        }
    }
    if let Some(default) = step.config.get("default").and_then(Value::as_str) {
        if step.next_steps.iter().any(|n| n == default) {
            return Ok(Some(default.to_string()));
        }
    }
    Err(StepError::with_code(
        ErrorCode::SwitchNoMatch,
        format!("switch {} matched no successor", step.name),
    ))
}

/// Walk the step graph from `start`, threading `state` through each step.
fn walk_flow<C>(
    shared: Arc<WalkShared<C>>,
    start: String,
    state: Value,
) -> HookFuture<Result<WalkOutcome, StepError>>
where
    C: Clock + Clone + 'static,
{
    Box::pin(async move {
        let mut state = state;
        let mut executed: Vec<String> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = start;

        loop {
            let Some(step) = shared.spec.step(&current).cloned() else {
                return Err(StepError::with_code(
                    ErrorCode::MissingStep,
                    format!("unknown step: {current}"),
                ));
            };
            let step_id = shared.spec.step_id(&current).unwrap_or_default();
            let ctx = StepCtx {
                flow: shared.spec.name.clone(),
                flow_id: shared.spec.flow_id().to_string(),
                run_id: shared.run_id.clone(),
                step: current.clone(),
                step_id: step_id.clone(),
                inputs: shared.inputs.clone(),
                config: step.config.clone(),
            };

            visited.insert(current.clone());
            executed.push(current.clone());

            let t0 = shared.clock.epoch_s();
            let outcome: Result<Option<String>, StepError> = async {
                if let Some(governance) = &shared.governance {
                    if let Err(rejection) = governance.check_step(&shared.spec.name, &current) {
                        return Err(StepError::with_code(rejection.code, rejection.message));
                    }
                }
                if let Some(before) = &step.before {
                    guarded(&shared, before(ctx.clone())).await??;
                }
                let output = match &step.run {
                    Some(run) => guarded(&shared, run(ctx.clone(), state.clone())).await??,
                    None => json!({}),
                };
                merge_state(&mut state, &output);
                if let Some(after) = &step.after {
                    guarded(&shared, after(ctx.clone(), output)).await??;
                }

                match step.operation {
                    Operation::Finish => Ok(None),
                    Operation::Task => Ok(step.next_steps.first().cloned()),
                    Operation::Switch => resolve_switch(&step),
                    Operation::Parallel => {
                        let branches: Vec<String> = step
                            .config
                            .get("branches")
                            .and_then(Value::as_array)
                            .map(|items| {
                                items
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default();

                        let mut handles = Vec::with_capacity(branches.len());
                        for branch in &branches {
                            if shared.spec.step(branch).is_none() {
                                return Err(StepError::with_code(
                                    ErrorCode::MissingStep,
                                    format!("unknown parallel branch: {branch}"),
                                ));
                            }
                            handles.push(tokio::spawn(walk_flow(
                                shared.clone(),
                                branch.clone(),
                                state.clone(),
                            )));
                        }
                        // Merge branch outputs in listed order; later
                        // branches override earlier keys
                        for handle in handles {
                            let branch = handle.await.map_err(|e| {
                                StepError::new(format!("parallel branch failed: {e}"))
                            })??;
                            merge_state(&mut state, &branch.state);
                            executed.extend(branch.executed);
                        }
                        Ok(step.next_steps.first().cloned())
                    }
                }
            }
            .await;
            let t1 = shared.clock.epoch_s();

            match outcome {
                Ok(next) => {
                    shared.recorder.emit(&current, &step_id, t0, t1, None);
                    match next {
                        Some(next) if !visited.contains(&next) => current = next,
                        _ => return Ok(WalkOutcome { state, executed }),
                    }
                }
                Err(err) => {
                    if let Some(on_error) = &step.on_error {
                        on_error(ctx.clone(), err.clone()).await;
                    }
                    shared.recorder.emit(&current, &step_id, t0, t1, Some(&err));
                    return Err(err);
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
