// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn first_step_added_becomes_entrypoint() {
    let mut spec = FlowSpec::new("demo");
    spec.add_step(StepDef::new("start", Operation::Task).with_next(["finish"]));
    spec.add_step(StepDef::new("finish", Operation::Finish));

    assert_eq!(spec.entrypoint(), Some("start"));
    assert!(spec.validate().is_ok());
}

#[test]
fn revision_changes_on_add() {
    let mut spec = FlowSpec::new("demo");
    let rev1 = spec.flow_revision();
    spec.add_step(StepDef::new("start", Operation::Task));
    let rev2 = spec.flow_revision();

    assert!(rev1.starts_with("rev-"));
    assert!(rev2.starts_with("rev-"));
    assert_ne!(rev1, rev2);
    assert_eq!(spec.flow_id(), "demo");
}

#[test]
fn revision_is_stable_across_fresh_construction() {
    let build = || {
        let mut spec = FlowSpec::new("demo");
        spec.add_step(
            StepDef::new("start", Operation::Task)
                .with_next(["finish"])
                .with_config(serde_json::json!({"route": "left"})),
        );
        spec.add_step(StepDef::new("finish", Operation::Finish));
        spec
    };
    assert_eq!(build().flow_revision(), build().flow_revision());
}

#[test]
fn revision_reflects_config_change() {
    let mut base = FlowSpec::new("demo");
    base.add_step(
        StepDef::new("start", Operation::Task).with_config(serde_json::json!({"route": "left"})),
    );

    let mut modified = FlowSpec::new("demo");
    modified.add_step(
        StepDef::new("start", Operation::Task).with_config(serde_json::json!({"route": "right"})),
    );

    assert_ne!(base.flow_revision(), modified.flow_revision());
}

#[test]
fn custom_flow_id() {
    let spec = FlowSpec::new("demo").with_flow_id("flow-123");
    assert_eq!(spec.flow_id(), "flow-123");
}

#[test]
fn step_id_stable_for_same_flow() {
    let mut spec1 = FlowSpec::new("demo");
    spec1.add_step(StepDef::new("start", Operation::Task));
    let mut spec2 = FlowSpec::new("demo");
    spec2.add_step(StepDef::new("start", Operation::Task));

    let sid1 = spec1.step_id("start").unwrap();
    let sid2 = spec2.step_id("start").unwrap();

    assert_eq!(sid1, sid2);
    assert!(sid1.starts_with("step-"));
    assert!(spec1.step_id("missing").is_none());
}

#[test]
fn validate_rejects_unresolved_target() {
    let mut spec = FlowSpec::new("demo");
    spec.add_step(StepDef::new("start", Operation::Task).with_next(["ghost"]));

    match spec.validate() {
        Err(SpecError::UnresolvedTarget { step, target }) => {
            assert_eq!(step, "start");
            assert_eq!(target, "ghost");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn validate_rejects_finish_with_successors() {
    let mut spec = FlowSpec::new("demo");
    spec.add_step(StepDef::new("end", Operation::Finish).with_next(["end"]));

    assert!(matches!(
        spec.validate(),
        Err(SpecError::FinishWithSuccessors(_))
    ));
}

#[test]
fn validate_rejects_empty_spec() {
    let spec = FlowSpec::new("demo");
    assert!(matches!(spec.validate(), Err(SpecError::NoEntrypoint)));
}

#[test]
fn set_entrypoint_requires_known_step() {
    let mut spec = FlowSpec::new("demo");
    spec.add_step(StepDef::new("a", Operation::Task));
    spec.add_step(StepDef::new("b", Operation::Task));

    spec.set_entrypoint("b").unwrap();
    assert_eq!(spec.entrypoint(), Some("b"));
    assert!(spec.set_entrypoint("ghost").is_err());
}

#[tokio::test]
async fn sync_and_async_adapters_run() {
    let sync = sync_run_fn(|_ctx, state| Ok(state));
    let asynchronous = run_fn(|_ctx, state: Value| async move { Ok(state) });

    let ctx = StepCtx {
        flow: "demo".into(),
        flow_id: "demo".into(),
        run_id: RunId::new("run-1"),
        step: "start".into(),
        step_id: "step-x".into(),
        inputs: serde_json::json!({}),
        config: serde_json::json!({}),
    };

    let out1 = sync(ctx.clone(), serde_json::json!({"v": 1})).await.unwrap();
    let out2 = asynchronous(ctx, serde_json::json!({"v": 2})).await.unwrap();
    assert_eq!(out1, serde_json::json!({"v": 1}));
    assert_eq!(out2, serde_json::json!({"v": 2}));
}

#[test]
fn adjacency_preserves_insertion_order() {
    let mut spec = FlowSpec::new("demo");
    spec.add_step(StepDef::new("start", Operation::Task).with_next(["mid"]));
    spec.add_step(StepDef::new("mid", Operation::Task).with_next(["finish"]));
    spec.add_step(StepDef::new("finish", Operation::Finish));

    let adjacency = spec.adjacency();
    let names: Vec<&String> = adjacency.keys().collect();
    assert_eq!(names, ["start", "mid", "finish"]);
    assert_eq!(adjacency["start"], vec!["mid".to_string()]);
}
