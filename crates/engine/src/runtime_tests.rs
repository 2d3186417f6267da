// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::governance::{GovernanceConfig, GovernanceManager, GuardConfig, GuardRule, LimitsConfig};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use tm_core::{run_fn, sync_run_fn, FlowSpec, Operation, StepDef};

#[derive(Default)]
struct VecSink {
    spans: Mutex<Vec<TraceSpan>>,
}

impl TraceSink for VecSink {
    fn append(&self, span: &TraceSpan) {
        self.spans.lock().push(span.clone());
    }
}

fn switch_spec(name: &str, key: Option<&str>) -> FlowSpec {
    let mut spec = FlowSpec::new(name);
    spec.add_step(StepDef::new("start", Operation::Task).with_next(["router"]));
    let mut config = json!({"default": "left"});
    if let Some(key) = key {
        config["key"] = json!(key);
    }
    spec.add_step(
        StepDef::new("router", Operation::Switch)
            .with_next(["left", "right"])
            .with_config(config),
    );
    spec.add_step(StepDef::new("left", Operation::Task).with_next(["finish"]));
    spec.add_step(StepDef::new("right", Operation::Task).with_next(["finish"]));
    spec.add_step(StepDef::new("finish", Operation::Finish));
    spec
}

fn steps_of(record: &FlowRunRecord) -> Vec<String> {
    record.output["steps"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn switch_follows_default_path() {
    let runtime = FlowRuntime::new(RuntimeConfig::default());
    runtime.register(switch_spec("demo", None));

    let record = runtime.run("demo", json!({}), RunCtx::default(), None).await;

    assert_eq!(record.status, RunStatus::Ok);
    assert_eq!(record.flow, "demo");
    assert_eq!(steps_of(&record), ["start", "router", "left", "finish"]);
}

#[tokio::test]
async fn switch_respects_key_selection() {
    let runtime = FlowRuntime::new(RuntimeConfig::default());
    runtime.register(switch_spec("branch", Some("right")));

    let record = runtime.run("branch", json!({}), RunCtx::default(), None).await;
    assert_eq!(steps_of(&record), ["start", "router", "right", "finish"]);
}

#[tokio::test]
async fn switch_key_is_literal_and_ignores_state() {
    let mut spec = switch_spec("literal", Some("right"));
    // An unrelated state field named after the key must not affect routing
    spec.add_step(
        StepDef::new("start", Operation::Task)
            .with_next(["router"])
            .with_run(sync_run_fn(|_ctx, _state| {
                Ok(json!({"right": "unknown-value"}))
            })),
    );
    let runtime = FlowRuntime::new(RuntimeConfig::default());
    runtime.register(spec);

    let record = runtime.run("literal", json!({}), RunCtx::default(), None).await;
    assert_eq!(steps_of(&record), ["start", "router", "right", "finish"]);
}

#[tokio::test]
async fn switch_without_match_fails_step() {
    let mut spec = FlowSpec::new("no-match");
    spec.add_step(
        StepDef::new("router", Operation::Switch)
            .with_next(["left"])
            .with_config(json!({"key": "ghost"})),
    );
    spec.add_step(StepDef::new("left", Operation::Task));
    let runtime = FlowRuntime::new(RuntimeConfig::default());
    runtime.register(spec);

    let record = runtime.run("no-match", json!({}), RunCtx::default(), None).await;
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.error_code, Some(ErrorCode::SwitchNoMatch));
}

#[tokio::test]
async fn lifecycle_hooks_execute_in_order() {
    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    let before_events = events.clone();
    let run_events = events.clone();
    let after_events = events.clone();
    let mut spec = FlowSpec::new("hooked");
    spec.add_step(
        StepDef::new("start", Operation::Task)
            .with_next(["finish"])
            .with_before(tm_core::before_fn(move |ctx| {
                let events = before_events.clone();
                async move {
                    events.lock().push(format!("before:{}", ctx.step));
                    Ok(())
                }
            }))
            .with_run(run_fn(move |ctx, state: Value| {
                let events = run_events.clone();
                async move {
                    events.lock().push(format!("run:{}", ctx.step));
                    let value = state["value"].as_i64().unwrap_or(0);
                    Ok(json!({"value": value + 1}))
                }
            }))
            .with_after(tm_core::after_fn(move |ctx, output: Value| {
                let events = after_events.clone();
                async move {
                    events
                        .lock()
                        .push(format!("after:{}:{}", ctx.step, output["value"]));
                    Ok(())
                }
            })),
    );
    spec.add_step(StepDef::new("finish", Operation::Finish));

    let runtime = FlowRuntime::new(RuntimeConfig::default());
    runtime.register(spec);
    let record = runtime
        .run("hooked", json!({"value": 1}), RunCtx::default(), None)
        .await;

    assert_eq!(record.status, RunStatus::Ok);
    assert_eq!(record.output["state"]["value"], 2);
    let events = events.lock().clone();
    assert_eq!(events, ["before:start", "run:start", "after:start:2"]);
}

#[tokio::test]
async fn on_error_invoked_and_after_skipped() {
    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    let run_events = events.clone();
    let after_events = events.clone();
    let error_events = events.clone();
    let mut spec = FlowSpec::new("error-flow");
    spec.add_step(
        StepDef::new("start", Operation::Task)
            .with_run(run_fn(move |_ctx, _state: Value| {
                let events = run_events.clone();
                async move {
                    events.lock().push("run".to_string());
                    Err(StepError::new("boom"))
                }
            }))
            .with_after(tm_core::after_fn(move |_ctx, _output: Value| {
                let events = after_events.clone();
                async move {
                    events.lock().push("after".to_string());
                    Ok(())
                }
            }))
            .with_on_error(tm_core::on_error_fn(move |ctx, err| {
                let events = error_events.clone();
                async move {
                    events.lock().push(format!("error:{}:{}", ctx.step, err.message));
                }
            })),
    );

    let runtime = FlowRuntime::new(RuntimeConfig::default());
    runtime.register(spec);
    let record = runtime.run("error-flow", json!({}), RunCtx::default(), None).await;

    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.error_message.as_deref(), Some("boom"));
    let events = events.lock().clone();
    assert_eq!(events, ["run", "error:start:boom"]);
}

#[tokio::test]
async fn trace_spans_are_dense_and_ordered() {
    let mut spec = FlowSpec::new("ordered");
    let sleepy = || {
        run_fn(|_ctx, state: Value| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(state)
        })
    };
    spec.add_step(StepDef::new("a", Operation::Task).with_next(["b"]).with_run(sleepy()));
    spec.add_step(StepDef::new("b", Operation::Task).with_next(["c"]).with_run(sleepy()));
    spec.add_step(StepDef::new("c", Operation::Task).with_run(sleepy()));

    let sink = Arc::new(VecSink::default());
    let runtime = Arc::new(
        FlowRuntime::new(RuntimeConfig::default()).with_trace_sink(sink.clone()),
    );
    runtime.register(spec);

    let mut handles = Vec::new();
    for i in 0..50 {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime.run("ordered", json!({"value": i}), RunCtx::default(), None).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().status, RunStatus::Ok);
    }

    let spans = sink.spans.lock().clone();
    let mut by_run: HashMap<RunId, Vec<TraceSpan>> = HashMap::new();
    for span in spans {
        by_run.entry(span.run_id.clone()).or_default().push(span);
    }
    assert_eq!(by_run.len(), 50);
    for spans in by_run.values() {
        let seqs: Vec<u64> = spans.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        let steps: Vec<&str> = spans.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(steps, ["a", "b", "c"]);
        assert!(spans.iter().all(|s| s.status == SpanStatus::Ok));
        assert!(spans.iter().all(|s| s.flow_rev.starts_with("rev-")));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idempotency_joins_inflight_and_caches() {
    let executions = Arc::new(AtomicUsize::new(0));

    let mut spec = FlowSpec::new("idem");
    let counter = executions.clone();
    spec.add_step(StepDef::new("start", Operation::Task).with_run(run_fn(
        move |_ctx, state: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                let value = state["value"].as_i64().unwrap_or(0);
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
        idempotency_key: Some("demo-1".to_string()),
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
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // TTL expiry allows one more execution
    tokio::time::sleep(Duration::from_millis(200)).await;
    runtime.run("idem", json!({"value": 1}), ctx.clone(), None).await;
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    // A different key executes independently
    let other = RunCtx {
        idempotency_key: Some("other".to_string()),
        ..RunCtx::default()
    };
    runtime.run("idem", json!({"value": 5}), other, None).await;
    assert_eq!(executions.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_rejects_overflow_with_queue_full() {
    let mut spec = FlowSpec::new("slow");
    spec.add_step(StepDef::new("start", Operation::Task).with_run(run_fn(
        |_ctx, state: Value| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(state)
        },
    )));

    let runtime = Arc::new(FlowRuntime::new(RuntimeConfig {
        max_concurrency: 2,
        queue_capacity: 3,
        ..RuntimeConfig::default()
    }));
    runtime.register(spec);

    let mut handles = Vec::new();
    for i in 0..50 {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime.run("slow", json!({"index": i}), RunCtx::default(), None).await
        }));
    }
    let mut successes = 0u32;
    let mut rejections = 0u32;
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
    assert_eq!(successes + rejections, 50);
    assert!(rejections > 0);

    let stats = runtime.stats();
    assert!(stats.active_peak <= 2);
    assert!(stats.queue_depth_peak <= 3);
    assert_eq!(stats.rejected_reason["QUEUE_FULL"], u64::from(rejections));
    assert!(stats.exec_ms_p50 >= 0.0);
}

#[tokio::test]
async fn queue_wait_timeout_rejects() {
    let mut spec = FlowSpec::new("stuck");
    spec.add_step(StepDef::new("start", Operation::Task).with_run(run_fn(
        |_ctx, state: Value| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(state)
        },
    )));

    let runtime = Arc::new(FlowRuntime::new(RuntimeConfig {
        max_concurrency: 1,
        queue_capacity: 10,
        queue_wait_timeout_ms: Some(20),
        ..RuntimeConfig::default()
    }));
    runtime.register(spec);

    let first = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run("stuck", json!({}), RunCtx::default(), None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = runtime.run("stuck", json!({}), RunCtx::default(), None).await;

    assert_eq!(second.status, RunStatus::Rejected);
    assert_eq!(second.error_code, Some(ErrorCode::QueueTimeout));
    assert_eq!(first.await.unwrap().status, RunStatus::Ok);
}

#[tokio::test]
async fn deferred_requires_policy_opt_in() {
    let mut spec = FlowSpec::new("async");
    spec.add_step(StepDef::new("start", Operation::Task));
    let runtime = FlowRuntime::new(RuntimeConfig {
        policies: FlowPolicies {
            response_mode: ResponseMode::Deferred,
            allow_deferred: false,
            short_wait_s: 0.0,
        },
        ..RuntimeConfig::default()
    });
    runtime.register(spec);

    let record = runtime.run("async", json!({}), RunCtx::default(), None).await;
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.error_code, Some(ErrorCode::DeferredDisabled));
}

#[tokio::test]
async fn deferred_returns_pending_then_ready() {
    let mut spec = FlowSpec::new("async");
    spec.add_step(StepDef::new("start", Operation::Task));
    let runtime = FlowRuntime::new(RuntimeConfig {
        policies: FlowPolicies {
            response_mode: ResponseMode::Deferred,
            allow_deferred: true,
            short_wait_s: 0.0,
        },
        ..RuntimeConfig::default()
    });
    runtime.register(spec);

    let pending = runtime
        .run("async", json!({"req_id": "R1"}), RunCtx::default(), None)
        .await;
    assert_eq!(pending.status, RunStatus::Ok);
    assert_eq!(pending.output["status"], "pending");
    let token = pending.output["token"].as_str().unwrap().to_string();
    assert!(!token.is_empty());
    assert!(runtime.correlator().resolve(&token).is_some());

    runtime
        .correlator()
        .signal("R1", json!({"status": "ready", "ok": true}));

    let ready = runtime
        .run("async", json!({"req_id": "R1"}), RunCtx::default(), None)
        .await;
    assert_eq!(ready.status, RunStatus::Ok);
    assert_eq!(ready.output["status"], "ready");
    assert_eq!(ready.output["result"], json!({"status": "ready", "ok": true}));
}

#[tokio::test]
async fn parallel_branches_merge_in_listed_order() {
    let mut spec = FlowSpec::new("fanout");
    spec.add_step(
        StepDef::new("split", Operation::Parallel)
            .with_next(["finish"])
            .with_config(json!({"branches": ["left", "right"]})),
    );
    spec.add_step(StepDef::new("left", Operation::Task).with_run(sync_run_fn(
        |_ctx, _state| Ok(json!({"left": 1, "shared": "from-left"})),
    )));
    spec.add_step(StepDef::new("right", Operation::Task).with_run(sync_run_fn(
        |_ctx, _state| Ok(json!({"right": 2, "shared": "from-right"})),
    )));
    spec.add_step(StepDef::new("finish", Operation::Finish));

    let sink = Arc::new(VecSink::default());
    let runtime = FlowRuntime::new(RuntimeConfig::default()).with_trace_sink(sink.clone());
    runtime.register(spec);

    let record = runtime.run("fanout", json!({}), RunCtx::default(), None).await;

    assert_eq!(record.status, RunStatus::Ok);
    let state = &record.output["state"];
    assert_eq!(state["left"], 1);
    assert_eq!(state["right"], 2);
    // Later branches override earlier keys
    assert_eq!(state["shared"], "from-right");

    let steps = steps_of(&record);
    assert_eq!(steps[0], "split");
    assert!(steps.contains(&"left".to_string()));
    assert!(steps.contains(&"right".to_string()));
    assert_eq!(*steps.last().unwrap(), "finish");

    // Spans stay dense even across concurrent branches
    let spans = sink.spans.lock().clone();
    let mut seqs: Vec<u64> = spans.iter().map(|s| s.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..spans.len() as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn cancellation_aborts_at_suspension_point() {
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = errors.clone();

    let mut spec = FlowSpec::new("cancellable");
    spec.add_step(
        StepDef::new("start", Operation::Task)
            .with_run(run_fn(|_ctx, state: Value| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(state)
            }))
            .with_on_error(tm_core::on_error_fn(move |_ctx, err| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(err.code_str().unwrap_or("NONE").to_string());
                }
            })),
    );
    let runtime = Arc::new(FlowRuntime::new(RuntimeConfig::default()));
    runtime.register(spec);

    let cancel = CancelToken::new();
    let ctx = RunCtx {
        cancel: Some(cancel.clone()),
        ..RunCtx::default()
    };
    let handle = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run("cancellable", json!({}), ctx, None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let record = handle.await.unwrap();
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.error_code, Some(ErrorCode::Cancelled));
    assert_eq!(errors.lock().clone(), ["CANCELLED"]);
}

#[tokio::test]
async fn run_timeout_uses_timeout_code() {
    let mut spec = FlowSpec::new("slowpoke");
    spec.add_step(StepDef::new("start", Operation::Task).with_run(run_fn(
        |_ctx, state: Value| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(state)
        },
    )));
    let runtime = FlowRuntime::new(RuntimeConfig::default());
    runtime.register(spec);

    let ctx = RunCtx {
        timeout_ms: Some(20),
        ..RunCtx::default()
    };
    let record = runtime.run("slowpoke", json!({}), ctx, None).await;
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.error_code, Some(ErrorCode::Timeout));
}

#[tokio::test]
async fn governance_rejection_short_circuits() {
    let mut spec = FlowSpec::new("guarded");
    spec.add_step(StepDef::new("start", Operation::Task));
    let config = GovernanceConfig {
        enabled: true,
        guard: GuardConfig {
            enabled: true,
            rules: vec![GuardRule {
                rule_type: "length_max".into(),
                path: "$.text".into(),
                value: 3,
            }],
        },
        limits: LimitsConfig::default(),
    };
    let sink = Arc::new(VecSink::default());
    let runtime = FlowRuntime::new(RuntimeConfig::default())
        .with_governance(Arc::new(GovernanceManager::new(config)))
        .with_trace_sink(sink.clone());
    runtime.register(spec);

    let record = runtime
        .run("guarded", json!({"text": "blocked"}), RunCtx::default(), None)
        .await;

    assert_eq!(record.status, RunStatus::Rejected);
    assert_eq!(record.error_code, Some(ErrorCode::GuardBlocked));
    // Rejections produce no trace spans
    assert!(sink.spans.lock().is_empty());
    assert_eq!(runtime.stats().rejected_reason["GUARD_BLOCKED"], 1);
}

#[tokio::test]
async fn unknown_flow_is_an_error_record() {
    let runtime = FlowRuntime::new(RuntimeConfig::default());
    let record = runtime.run("ghost", json!({}), RunCtx::default(), None).await;
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.error_code, Some(ErrorCode::MissingStep));
}

#[tokio::test]
async fn run_listeners_receive_records() {
    let seen = Arc::new(Mutex::new(Vec::<FlowRunRecord>::new()));
    let sink = seen.clone();

    let mut spec = FlowSpec::new("observed");
    spec.add_step(StepDef::new("start", Operation::Task));
    let runtime = FlowRuntime::new(RuntimeConfig::default()).with_run_listener(run_listener(
        move |record| {
            let sink = sink.clone();
            async move {
                sink.lock().push(record);
            }
        },
    ));
    runtime.register(spec);

    let record = runtime.run("observed", json!({}), RunCtx::default(), None).await;
    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].run_id, record.run_id);
    assert_eq!(seen[0].status, RunStatus::Ok);
}
