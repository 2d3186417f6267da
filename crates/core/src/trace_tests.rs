// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn span(seq: u64, status: SpanStatus) -> TraceSpan {
    TraceSpan {
        flow: "demo".into(),
        flow_id: "demo".into(),
        flow_rev: "rev-abc".into(),
        run_id: RunId::new("run-1"),
        step: "start".into(),
        step_id: "step-x".into(),
        seq,
        t0: 1.0,
        t1: 2.0,
        status,
        error_code: None,
        error_message: None,
    }
}

#[test]
fn span_serializes_without_empty_error_fields() {
    let value = serde_json::to_value(span(0, SpanStatus::Ok)).unwrap();
    assert_eq!(value["status"], "ok");
    assert_eq!(value["seq"], 0);
    assert!(value.get("error_code").is_none());
    assert!(value.get("error_message").is_none());
}

#[test]
fn span_round_trips_error_fields() {
    let mut original = span(3, SpanStatus::Error);
    original.error_code = Some("SWITCH_NO_MATCH".into());
    original.error_message = Some("no branch".into());

    let value = serde_json::to_value(&original).unwrap();
    let back: TraceSpan = serde_json::from_value(value).unwrap();
    assert_eq!(back, original);
}
