//! A single-process chain trace: root run, one child, both closed with
//! outputs, then a flush before exit.

use serde_json::json;
use tracehook::{Client, RunType};

#[tokio::main]
async fn main() -> tracehook::Result<()> {
    tracing_subscriber::fmt::init();
    tracehook::init();

    let client = Client::from_env()?;

    let mut root = client
        .create_run("parent", RunType::Chain, json!({"question": "why is the sky blue?"}))
        .await;

    let ctx = tracehook::AmbientContext {
        parent: Some(tracehook::ParentStub {
            id: root.id,
            trace_id: root.trace_id.unwrap(),
            dotted_order: root.dotted_order.clone().unwrap(),
        }),
        ..Default::default()
    };

    let mut child = tracehook::trace(ctx, client.create_run("retrieve_docs", RunType::Retriever, json!({"query": "sky color"}))).await;
    child.end(Some(json!({"docs": ["rayleigh scattering"]})), None);
    client.update_run(&child).await;

    root.end(Some(json!({"answer": "rayleigh scattering"})), None);
    client.update_run(&root).await;

    client.flush().await;
    println!("dropped operations: {}", client.pending_drops());
    Ok(())
}
