//! Byte-cap backpressure (spec §8 scenario S3): enqueuing past a tiny
//! `queue_byte_cap` must suspend the caller rather than drop the run, and
//! must release once an in-flight upload completes.

use std::io::{Read, Write};
use std::net::TcpListener;

use serde_json::json;
use tracehook::{Client, Config, RunType};

/// A single-connection HTTP server that holds the request open for
/// `stall` before replying 202, standing in for a slow ingest backend.
fn spawn_stalling_server(stall: std::time::Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            std::thread::sleep(stall);
            let _ = stream.write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n");
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn second_enqueue_blocks_until_the_stalled_upload_releases_its_budget() {
    let endpoint = spawn_stalling_server(std::time::Duration::from_millis(300));
    let mut config = Config::builder(endpoint, "test-key");
    config.queue_byte_cap = 32;
    config.batch_size_limit = 1;
    config.batch_byte_limit = 8;
    let client = Client::with_config(config).unwrap();

    client.create_run("first", RunType::Chain, json!({"payload": "x".repeat(16)})).await;

    let blocked = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .create_run("second", RunType::Chain, json!({"payload": "x".repeat(16)}))
                .await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!blocked.is_finished(), "second create_run should still be suspended");

    blocked.await.unwrap();
    client.flush().await;
}
