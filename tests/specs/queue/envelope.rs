// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Envelope wire format round-trip.

use serde_json::json;
use std::collections::HashMap;
use tm_core::TaskEnvelope;

#[test]
fn decode_of_encode_is_identity() {
    let mut headers = HashMap::new();
    headers.insert("idempotency_key".to_string(), "abc".to_string());
    headers.insert("origin".to_string(), "http".to_string());

    let envelope = TaskEnvelope::new(
        "demo.flow",
        json!({"value": 1, "nested": {"deep": [1, 2, 3]}}),
        Some(headers),
        Some(json!({"trace_id": "t-1"})),
        1_700_000_000.5,
    );

    let encoded = serde_json::to_vec(&envelope).unwrap();
    let decoded: TaskEnvelope = serde_json::from_slice(&encoded).unwrap();
    assert_eq!(decoded, envelope);
    assert_eq!(decoded.composite_key(), "abc");
}

#[test]
fn wire_schema_field_names() {
    let envelope = TaskEnvelope::new("demo", json!({}), None, None, 2.5);
    let value = envelope.to_value().unwrap();
    for field in ["task_id", "flow_id", "input", "headers", "trace", "attempt", "created_ts"] {
        assert!(value.get(field).is_some(), "missing field {field}");
    }
    assert_eq!(value["attempt"], 0);
    assert_eq!(value["created_ts"], 2.5);
}
