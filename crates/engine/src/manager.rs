// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task queue coordination: envelope construction, idempotency dedup,
//! retry scheduling, and DLQ routing.
//!
//! A task is in exactly one place at all times: queued, leased, acked, or
//! dead-lettered. The idempotency cache is consulted before enqueue and
//! written after a successful ack; failed attempts never touch it.

use crate::metrics::Registry;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tm_core::{
    Clock, RetryAction, RetryDecision, RetryPolicy, StepError, SystemClock, TaskEnvelope,
};
use tm_storage::{
    DeadLetterRecord, DeadLetterStore, DlqError, IdempotencyResult, IdempotencyStore, LeasedTask,
    QueueError, WorkQueue,
};
use tracing::info;

/// Errors from queue manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("dead letter error: {0}")]
    DeadLetter(#[from] DlqError),
}

/// Result of an enqueue attempt.
///
/// `queued=false` with a cached result is an idempotent replay;
/// `queued=false` without one means an identical key is still in flight.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOutcome {
    pub queued: bool,
    pub envelope: Option<TaskEnvelope>,
    pub cached_result: Option<IdempotencyResult>,
}

/// Composes a work queue, idempotency store, retry policy, and optional
/// dead-letter store behind one producer/consumer API.
pub struct TaskQueueManager<Q: WorkQueue, C: Clock = SystemClock> {
    queue: Mutex<Q>,
    store: IdempotencyStore<C>,
    dead_letters: Option<DeadLetterStore<C>>,
    retry_policy: RetryPolicy,
    default_ttl: f64,
    metrics: Arc<Registry>,
    clock: C,
    inflight_keys: Mutex<HashSet<String>>,
    inflight_count: Mutex<i64>,
}

impl<Q: WorkQueue, C: Clock> TaskQueueManager<Q, C> {
    pub fn new(queue: Q, store: IdempotencyStore<C>, clock: C) -> Self {
        Self {
            queue: Mutex::new(queue),
            store,
            dead_letters: None,
            retry_policy: RetryPolicy::default(),
            default_ttl: 300.0,
            metrics: Arc::new(Registry::new()),
            clock,
            inflight_keys: Mutex::new(HashSet::new()),
            inflight_count: Mutex::new(0),
        }
    }

    pub fn with_dead_letters(mut self, dead_letters: DeadLetterStore<C>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_default_ttl(mut self, default_ttl: f64) -> Self {
        self.default_ttl = default_ttl;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Registry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<Registry> {
        self.metrics.clone()
    }

    pub fn default_ttl(&self) -> f64 {
        self.default_ttl
    }

    /// The composed idempotency store (e.g. to force a snapshot at
    /// shutdown).
    pub fn idempotency(&self) -> &IdempotencyStore<C> {
        &self.store
    }

    fn update_gauges(&self) {
        let pending = self.queue.lock().pending_count() as i64;
        let inflight = (*self.inflight_count.lock()).max(0);
        self.metrics
            .gauge_set("tm_queue_depth", &[], (pending - inflight).max(0) as f64);
        self.metrics
            .gauge_set("tm_queue_inflight", &[], inflight as f64);
    }

    /// Enqueue a task unless its composite key short-circuits.
    pub fn enqueue(
        &self,
        flow_id: &str,
        input: Value,
        headers: Option<HashMap<String, String>>,
        trace: Option<Value>,
    ) -> Result<EnqueueOutcome, ManagerError> {
        let envelope = TaskEnvelope::new(flow_id, input, headers, trace, self.clock.epoch_s());

        if let Some(key) = envelope.idempotency_key() {
            if let Some(cached) = self.store.get(key) {
                self.metrics
                    .counter_inc("tm_queue_idempo_hits_total", &[("flow", flow_id)], 1.0);
                return Ok(EnqueueOutcome {
                    queued: false,
                    envelope: None,
                    cached_result: Some(cached),
                });
            }
            let mut inflight = self.inflight_keys.lock();
            if !inflight.insert(key.to_string()) {
                return Ok(EnqueueOutcome::default());
            }
        }

        let put_result = self.queue.lock().put(&envelope);
        if let Err(e) = put_result {
            if let Some(key) = envelope.idempotency_key() {
                self.inflight_keys.lock().remove(key);
            }
            return Err(e.into());
        }
        self.metrics
            .counter_inc("tm_queue_enqueued_total", &[("flow", flow_id)], 1.0);
        self.update_gauges();
        Ok(EnqueueOutcome {
            queued: true,
            envelope: Some(envelope),
            cached_result: None,
        })
    }

    /// Lease up to `batch_size` tasks for `lease_ms`.
    pub fn lease(&self, batch_size: usize, lease_ms: u64) -> Result<Vec<LeasedTask>, ManagerError> {
        let leased = self.queue.lock().lease(batch_size, lease_ms)?;
        *self.inflight_count.lock() += leased.len() as i64;
        self.update_gauges();
        Ok(leased)
    }

    /// Close a lease as a terminal success.
    pub fn ack(&self, lease: &LeasedTask) -> Result<(), ManagerError> {
        self.queue.lock().ack(lease.offset, &lease.token)?;
        self.close_lease(lease);
        self.metrics.counter_inc(
            "tm_queue_acked_total",
            &[("flow", &lease.envelope.flow_id)],
            1.0,
        );
        self.update_gauges();
        Ok(())
    }

    /// Cancel a lease; with `requeue` the task is immediately eligible again.
    pub fn nack(&self, lease: &LeasedTask, requeue: bool) -> Result<(), ManagerError> {
        self.queue.lock().nack(lease.offset, &lease.token, requeue)?;
        *self.inflight_count.lock() -= 1;
        self.update_gauges();
        Ok(())
    }

    /// Cache a completed result so later enqueues with the same composite
    /// key short-circuit.
    pub fn record_result(&self, envelope: &TaskEnvelope, result: IdempotencyResult, ttl: f64) {
        self.store.remember(envelope.composite_key(), result, ttl);
    }

    /// Schedule a failed lease for redelivery after `delay_seconds`.
    pub fn record_retry(&self, lease: &LeasedTask, delay_seconds: f64) -> Result<(), ManagerError> {
        let delay_ms = (delay_seconds * 1000.0) as u64;
        self.queue
            .lock()
            .retry(lease.offset, &lease.token, delay_ms)?;
        *self.inflight_count.lock() -= 1;
        let flow = lease.envelope.flow_id.as_str();
        self.metrics
            .counter_inc("tm_retries_total", &[("flow", flow)], 1.0);
        self.metrics
            .counter_inc("tm_queue_redelivered_total", &[("flow", flow)], 1.0);
        self.update_gauges();
        Ok(())
    }

    /// Route a terminally failed lease to the dead-letter store.
    pub fn record_dead_letter(
        &self,
        lease: &LeasedTask,
        error: Value,
        reason: &str,
    ) -> Result<Option<DeadLetterRecord>, ManagerError> {
        self.queue.lock().ack(lease.offset, &lease.token)?;
        self.close_lease(lease);
        let flow = lease.envelope.flow_id.as_str();

        let mut error = error;
        if let Some(map) = error.as_object_mut() {
            map.insert("reason".to_string(), Value::from(reason));
        }

        let record = match &self.dead_letters {
            Some(store) => {
                let task = serde_json::to_value(&lease.envelope).unwrap_or(Value::Null);
                Some(store.append(flow, task, error, lease.envelope.attempt + 1)?)
            }
            None => {
                info!(flow, reason, "no dead letter store configured, dropping task");
                None
            }
        };
        self.metrics
            .counter_inc("tm_dlq_total", &[("flow", flow), ("reason", reason)], 1.0);
        self.update_gauges();
        Ok(record)
    }

    /// Consult the retry policy for a failed lease and apply its decision.
    pub fn handle_failure(
        &self,
        lease: &LeasedTask,
        error: &StepError,
    ) -> Result<RetryDecision, ManagerError> {
        let decision =
            self.retry_policy
                .decide(&lease.envelope.flow_id, lease.envelope.attempt, error);
        match decision.action {
            RetryAction::Retry => {
                self.record_retry(lease, decision.delay_seconds)?;
            }
            RetryAction::Dlq => {
                let reason = if error.retryable {
                    "max_attempts"
                } else {
                    "non_retryable"
                };
                let error_value = serde_json::to_value(error).unwrap_or(Value::Null);
                self.record_dead_letter(lease, error_value, reason)?;
            }
        }
        Ok(decision)
    }

    /// Number of unacked tasks in the backing queue.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().pending_count()
    }

    pub fn flush(&self) -> Result<(), ManagerError> {
        self.queue.lock().flush()?;
        Ok(())
    }

    pub fn close(&self) -> Result<(), ManagerError> {
        self.queue.lock().close()?;
        Ok(())
    }

    fn close_lease(&self, lease: &LeasedTask) {
        *self.inflight_count.lock() -= 1;
        if let Some(key) = lease.envelope.idempotency_key() {
            self.inflight_keys.lock().remove(key);
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
