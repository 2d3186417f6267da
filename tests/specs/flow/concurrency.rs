// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admission under load: concurrency cap, bounded queue, FIFO start order.

use serde_json::{json, Value};
use std::sync::Arc;
use parking_lot::Mutex;
use tm_core::{run_fn, ErrorCode, FlowSpec, Operation, RunStatus, StepDef};
use tm_engine::{FlowRuntime, RunCtx, RuntimeConfig};

#[tokio::test]
async fn overflow_rejects_and_accepted_runs_start_in_order() {
    let start_order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    let order = start_order.clone();
    let mut spec = FlowSpec::new("slow");
    spec.add_step(StepDef::new("start", Operation::Task).with_run(run_fn(
        move |_ctx, state: Value| {
            let order = order.clone();
            async move {
                order.lock().push(state["index"].as_i64().unwrap_or(-1));
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                Ok(state)
            }
        },
    )));

    let runtime = Arc::new(FlowRuntime::new(RuntimeConfig {
        max_concurrency: 100,
        queue_capacity: 300,
        ..RuntimeConfig::default()
    }));
    runtime.register(spec);

    let total = 2_000i64;
    let mut handles = Vec::with_capacity(total as usize);
    for index in 0..total {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime
                .run("slow", json!({"index": index}), RunCtx::default(), None)
                .await
        }));
    }

    let mut successes = 0u64;
    let mut rejections = 0u64;
    for handle in handles {
        let record = handle.await.unwrap();
        match record.status {
            RunStatus::Ok => successes += 1,
            RunStatus::Rejected => {
                assert_eq!(record.error_code, Some(ErrorCode::QueueFull));
                rejections += 1;
            }
            RunStatus::Error => panic!("unexpected error: {:?}", record.error_message),
        }
    }

    assert_eq!(successes + rejections, total as u64);
    assert!(rejections > 0);
    assert!(successes <= 100 + 300);

    let stats = runtime.stats();
    assert!(stats.active_peak <= 100);
    assert!(stats.queue_depth_peak <= 300);
    assert_eq!(stats.rejected_reason["QUEUE_FULL"], rejections);
    assert!(stats.exec_ms_p50 >= 0.0);

    // Accepted runs start strictly in submission order on the FIFO queue
    let order = start_order.lock().clone();
    assert_eq!(order.len() as u64, successes);
    let mut sorted = order.clone();
    sorted.sort_unstable();
    assert_eq!(order, sorted);
    if order.len() >= 10 {
        assert_eq!(&order[..10], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }
}
