// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for the behavioral specs.

use serde_json::{json, Value};
use tm_core::{FlowRunRecord, FlowSpec, Operation, StepDef};

/// `start -> router(SWITCH) -> {left,right} -> finish`, with an optional
/// literal routing key.
pub fn switch_spec(name: &str, key: Option<&str>) -> FlowSpec {
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

pub fn steps_of(record: &FlowRunRecord) -> Vec<String> {
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
