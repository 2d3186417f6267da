// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;
use std::sync::Arc;

#[test]
fn reserve_resolve_consume() {
    let hub = CorrelationHub::new();
    let token = hub.reserve("demo", json!({"req_id": "R1"}));

    let (flow, payload) = hub.resolve(&token).unwrap();
    assert_eq!(flow, "demo");
    assert_eq!(payload["req_id"], "R1");
    assert_eq!(hub.pending_count(), 1);

    assert!(hub.consume(&token).is_some());
    assert!(hub.consume(&token).is_none());
    assert_eq!(hub.pending_count(), 0);
}

#[test]
fn signals_are_consumed_once() {
    let hub = CorrelationHub::new();
    assert!(hub.consume_signal("R1").is_none());

    hub.signal("R1", json!({"status": "ready", "ok": true}));
    let payload = hub.consume_signal("R1").unwrap();
    assert_eq!(payload["ok"], true);
    assert!(hub.consume_signal("R1").is_none());
}

#[test]
fn tokens_are_unique() {
    let hub = CorrelationHub::new();
    let a = hub.reserve("demo", json!({}));
    let b = hub.reserve("demo", json!({}));
    assert_ne!(a, b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_access_is_safe() {
    let hub = Arc::new(CorrelationHub::new());
    let mut handles = Vec::new();
    for i in 0..32 {
        let hub = hub.clone();
        handles.push(tokio::spawn(async move {
            let token = hub.reserve("demo", json!({"i": i}));
            hub.signal(&format!("req-{i}"), json!({"i": i}));
            hub.consume(&token)
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_some());
    }
    for i in 0..32 {
        assert!(hub.consume_signal(&format!("req-{i}")).is_some());
    }
}
