// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trace invariants: every accepted run emits a dense, ordered span
//! sequence, preserved on the wire.

use crate::prelude::switch_spec;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tm_core::{RunId, RunStatus, TraceSpan};
use tm_engine::{FlowRuntime, FlowTraceSink, RunCtx, RuntimeConfig};
use tm_storage::BinaryLogReader;

#[tokio::test]
async fn spans_are_dense_and_wire_ordered_per_run() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(FlowTraceSink::open(dir.path(), 64_000_000).unwrap());

    let runtime = Arc::new(FlowRuntime::new(RuntimeConfig::default()).with_trace_sink(sink.clone()));
    runtime.register(switch_spec("traced", None));

    let mut handles = Vec::new();
    for i in 0..20 {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime
                .run("traced", json!({"i": i}), RunCtx::default(), None)
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().status, RunStatus::Ok);
    }
    sink.flush().unwrap();

    let reader = BinaryLogReader::new(dir.path());
    let mut by_run: HashMap<RunId, Vec<TraceSpan>> = HashMap::new();
    for frame in reader.scan().unwrap() {
        let (etype, payload) = frame.unwrap();
        assert_eq!(etype, "FlowTrace");
        let span: TraceSpan = serde_json::from_slice(&payload).unwrap();
        // Wire order within a run must already be monotonic in seq
        by_run.entry(span.run_id.clone()).or_default().push(span);
    }

    assert_eq!(by_run.len(), 20);
    for spans in by_run.values() {
        assert!(!spans.is_empty());
        let seqs: Vec<u64> = spans.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, (0..spans.len() as u64).collect::<Vec<_>>());
        let steps: Vec<&str> = spans.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(steps, ["start", "router", "left", "finish"]);
    }
}
