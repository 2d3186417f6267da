// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Switch routing: default path and explicit key selection.

use crate::prelude::{steps_of, switch_spec};
use serde_json::json;
use tm_core::RunStatus;
use tm_engine::{FlowRuntime, RunCtx, RuntimeConfig};

#[tokio::test]
async fn switch_takes_default_branch_without_key() {
    let runtime = FlowRuntime::new(RuntimeConfig::default());
    runtime.register(switch_spec("demo", None));

    let record = runtime.run("demo", json!({}), RunCtx::default(), None).await;

    assert_eq!(record.status, RunStatus::Ok);
    assert_eq!(steps_of(&record), ["start", "router", "left", "finish"]);
}

#[tokio::test]
async fn switch_takes_keyed_branch() {
    let runtime = FlowRuntime::new(RuntimeConfig::default());
    runtime.register(switch_spec("demo", Some("right")));

    let record = runtime.run("demo", json!({}), RunCtx::default(), None).await;

    assert_eq!(record.status, RunStatus::Ok);
    assert_eq!(steps_of(&record), ["start", "router", "right", "finish"]);
}
