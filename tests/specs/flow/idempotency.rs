// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! At-most-one concurrent execution per idempotency key, TTL re-execution.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tm_core::{run_fn, FlowSpec, Operation, RunStatus, StepDef};
use tm_engine::{FlowRuntime, RunCtx, RuntimeConfig};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_key_hits_share_one_execution() {
    let executions: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    let log = executions.clone();
    let mut spec = FlowSpec::new("idem");
    spec.add_step(StepDef::new("start", Operation::Task).with_run(run_fn(
        move |_ctx, state: Value| {
            let log = log.clone();
            async move {
                let value = state["value"].as_i64().unwrap_or(0);
                log.lock().push(value);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                Ok(json!({"value": value + 1}))
            }
        },
    )));

    let runtime = Arc::new(FlowRuntime::new(RuntimeConfig {
        max_concurrency: 10,
        queue_capacity: 20,
        idempotency_ttl_sec: 0.1,
        idempotency_cache_size: 4,
        ..RuntimeConfig::default()
    }));
    runtime.register(spec);

    let ctx = RunCtx {
        idempotency_key: Some("K".to_string()),
        ..RunCtx::default()
    };

    let mut handles = Vec::new();
    for _ in 0..100 {
        let runtime = runtime.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            runtime.run("idem", json!({"value": 1}), ctx, None).await
        }));
    }
    for handle in handles {
        let record = handle.await.unwrap();
        assert_eq!(record.status, RunStatus::Ok);
        assert_eq!(record.output["state"]["value"], 2);
    }
    assert_eq!(executions.lock().len(), 1);

    // After the TTL expires the same key executes once more
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let record = runtime.run("idem", json!({"value": 1}), ctx, None).await;
    assert_eq!(record.status, RunStatus::Ok);
    assert_eq!(executions.lock().len(), 2);
}
