// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Deferred execution: pending token, signal, ready redemption.

use serde_json::json;
use tm_core::{FlowSpec, Operation, RunStatus, StepDef};
use tm_engine::{FlowPolicies, FlowRuntime, ResponseMode, RunCtx, RuntimeConfig};

fn deferred_runtime() -> FlowRuntime {
    let runtime = FlowRuntime::new(RuntimeConfig {
        policies: FlowPolicies {
            response_mode: ResponseMode::Deferred,
            allow_deferred: true,
            short_wait_s: 0.0,
        },
        ..RuntimeConfig::default()
    });
    let mut spec = FlowSpec::new("async");
    spec.add_step(StepDef::new("start", Operation::Task));
    runtime.register(spec);
    runtime
}

#[tokio::test]
async fn deferred_run_returns_pending_then_ready() {
    let runtime = deferred_runtime();

    let pending = runtime
        .run("async", json!({"req_id": "R1"}), RunCtx::default(), None)
        .await;
    assert_eq!(pending.status, RunStatus::Ok);
    assert_eq!(pending.output["status"], "pending");
    let token = pending.output["token"].as_str().unwrap();
    assert!(!token.is_empty());

    runtime
        .correlator()
        .signal("R1", json!({"status": "ready", "ok": true}));

    let ready = runtime
        .run("async", json!({"req_id": "R1"}), RunCtx::default(), None)
        .await;
    assert_eq!(ready.status, RunStatus::Ok);
    assert_eq!(ready.output["status"], "ready");
    assert_eq!(
        ready.output["result"],
        json!({"status": "ready", "ok": true})
    );
}

#[tokio::test]
async fn short_wait_picks_up_signal_sent_during_poll() {
    let runtime = FlowRuntime::new(RuntimeConfig {
        policies: FlowPolicies {
            response_mode: ResponseMode::Deferred,
            allow_deferred: true,
            short_wait_s: 0.5,
        },
        ..RuntimeConfig::default()
    });
    let mut spec = FlowSpec::new("async");
    spec.add_step(StepDef::new("start", Operation::Task));
    runtime.register(spec);
    let runtime = std::sync::Arc::new(runtime);

    let correlator = runtime.correlator();
    let signaller = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        correlator.signal("R2", json!({"done": true}));
    });

    let record = runtime
        .run("async", json!({"req_id": "R2"}), RunCtx::default(), None)
        .await;
    signaller.await.unwrap();

    assert_eq!(record.output["status"], "ready");
    assert_eq!(record.output["result"], json!({"done": true}));
}
