//! Cross-process propagation and distributed rerooting (spec scenarios
//! S4/S5, in spirit): one "upstream" service creates a root run, hands its
//! propagation headers to a "downstream" service, which resumes the trace
//! and additionally mirrors the run into a second project with its own
//! trace identity.

use std::collections::HashMap;

use serde_json::json;
use tracehook::{AmbientContext, Client, ReplicaSpec, RunType};

#[tokio::main]
async fn main() -> tracehook::Result<()> {
    tracing_subscriber::fmt::init();
    tracehook::init();

    let upstream = Client::from_env()?;
    let root = upstream
        .create_run("handle_request", RunType::Chain, json!({"path": "/search"}))
        .await;

    // What would travel over the wire as `langsmith-trace` / `baggage`.
    let headers: HashMap<String, String> = tracehook::context::to_headers(
        root.trace_id.unwrap(),
        root.dotted_order.as_deref().unwrap(),
        &AmbientContext::default(),
    );

    // --- downstream service ---
    let downstream = Client::from_env()?;
    let inbound_ctx = tracehook::context::ambient_from_headers(&headers);

    let ctx = AmbientContext {
        replicas: vec![ReplicaSpec { project: "mirror-project".to_string(), reroot: true }],
        ..inbound_ctx
    };

    let mut child = tracehook::trace(
        ctx,
        downstream.create_run("rank_results", RunType::Chain, json!({"candidates": 42})),
    )
    .await;

    assert_eq!(child.parent_run_id, Some(root.id));
    assert_eq!(child.trace_id, root.trace_id);

    child.end(Some(json!({"ranked": 10})), None);
    downstream.update_run(&child).await;

    downstream.flush().await;
    upstream.flush().await;
    Ok(())
}
