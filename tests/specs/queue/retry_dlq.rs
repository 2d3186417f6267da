// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry budget exhaustion routes a task to the dead-letter store.

use serde_json::json;
use std::collections::HashMap;
use tm_core::{RetryAction, RetryPolicy, RetrySettings, StepError, SystemClock};
use tm_engine::TaskQueueManager;
use tm_storage::{DeadLetterStore, FileWorkQueue, IdempotencyStore};

#[test]
fn second_failure_lands_in_dlq_with_reason() {
    let base = tempfile::tempdir().unwrap();
    let queue = FileWorkQueue::open(&base.path().join("queue"), 1_000_000).unwrap();
    let store = IdempotencyStore::new(None, 32, 60.0);
    let dlq = DeadLetterStore::new(&base.path().join("dlq")).unwrap();
    let policy = RetryPolicy::new(
        RetrySettings {
            max_attempts: 2,
            base_ms: 0.0,
            factor: 1.0,
            jitter_ms: 0.0,
            dlq_after: None,
        },
        HashMap::new(),
    );
    let manager = TaskQueueManager::new(queue, store, SystemClock)
        .with_dead_letters(dlq)
        .with_retry_policy(policy);

    let outcome = manager.enqueue("demo", json!({"value": 1}), None, None).unwrap();
    assert!(outcome.queued);

    // First failure: retried with attempt bumped
    let lease = manager.lease(1, 60_000).unwrap().remove(0);
    assert_eq!(lease.envelope.attempt, 0);
    let decision = manager
        .handle_failure(&lease, &StepError::new("flaky"))
        .unwrap();
    assert_eq!(decision.action, RetryAction::Retry);

    let second = manager.lease(1, 60_000).unwrap().remove(0);
    assert_eq!(second.envelope.attempt, 1);

    // Second failure: exhausts max_attempts
    let decision = manager
        .handle_failure(&second, &StepError::new("flaky"))
        .unwrap();
    assert_eq!(decision.action, RetryAction::Dlq);

    let dlq_reader = DeadLetterStore::new(&base.path().join("dlq")).unwrap();
    let records = dlq_reader.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].flow_id, "demo");
    assert_eq!(records[0].attempt, 2);
    assert_eq!(records[0].error["reason"], "max_attempts");

    // Exactly one of: queued, leased, acked, dead-lettered
    assert_eq!(manager.pending_count(), 0);
}
