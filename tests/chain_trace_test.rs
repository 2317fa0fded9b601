//! End-to-end coverage for a single-process parent/child chain (spec
//! scenario S1) plus the universal dotted_order and trace_id invariants.

use serde_json::json;
use tracehook::{AmbientContext, Client, Config, ParentStub, RunType};

fn disabled_client() -> Client {
    let mut config = Config::builder("http://127.0.0.1:0", "test-key");
    config.tracing_enabled = false;
    Client::with_config(config).unwrap()
}

#[tokio::test]
async fn child_dotted_order_is_prefixed_by_parent() {
    let client = disabled_client();
    let root = client.create_run("parent", RunType::Chain, json!({})).await;

    let ctx = AmbientContext {
        parent: Some(ParentStub {
            id: root.id,
            trace_id: root.trace_id.unwrap(),
            dotted_order: root.dotted_order.clone().unwrap(),
        }),
        ..Default::default()
    };
    let child = tracehook::trace(ctx, client.create_run("child", RunType::Llm, json!({}))).await;

    assert_eq!(child.trace_id, root.trace_id);
    assert_eq!(child.parent_run_id, Some(root.id));
    assert!(child
        .dotted_order
        .unwrap()
        .starts_with(&format!("{}.", root.dotted_order.unwrap())));
}

#[tokio::test]
async fn closing_a_run_never_changes_its_trace_id() {
    let client = disabled_client();
    let mut root = client.create_run("parent", RunType::Chain, json!({"q": 1})).await;
    let trace_id = root.trace_id;

    root.end(Some(json!({"a": 2})), None);
    client.update_run(&root).await;

    assert_eq!(root.trace_id, trace_id);
}

#[tokio::test]
async fn grandchild_inherits_the_full_dotted_order_chain() {
    let client = disabled_client();
    let root = client.create_run("root", RunType::Chain, json!({})).await;

    let root_ctx = AmbientContext {
        parent: Some(ParentStub {
            id: root.id,
            trace_id: root.trace_id.unwrap(),
            dotted_order: root.dotted_order.clone().unwrap(),
        }),
        ..Default::default()
    };
    let child = tracehook::trace(root_ctx, client.create_run("child", RunType::Tool, json!({}))).await;

    let child_ctx = AmbientContext {
        parent: Some(ParentStub {
            id: child.id,
            trace_id: child.trace_id.unwrap(),
            dotted_order: child.dotted_order.clone().unwrap(),
        }),
        ..Default::default()
    };
    let grandchild = tracehook::trace(
        child_ctx,
        client.create_run("grandchild", RunType::Llm, json!({})),
    )
    .await;

    assert_eq!(grandchild.trace_id, root.trace_id);
    assert!(grandchild
        .dotted_order
        .unwrap()
        .starts_with(&format!("{}.", child.dotted_order.unwrap())));
}

#[tokio::test]
async fn disabled_client_never_enqueues_and_drops_nothing() {
    let client = disabled_client();
    client.create_run("root", RunType::Chain, json!({})).await;
    client.flush().await;
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.pending_drops(), 0);
}
