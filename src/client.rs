//! Thin, thread-safe public entry points (spec §4.9). Generalizes the
//! teacher's `LangSmithClient` (`src/client/http.rs`, now superseded) from
//! direct per-call HTTP POST/PATCH into enqueue-only façade methods backed
//! by the [`crate::buffer::OpBuffer`] / [`crate::worker::WorkerPool`]
//! pipeline.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::buffer::OpBuffer;
use crate::compress::Compressor;
use crate::config::{Config, IngestConfig};
use crate::context::{self, AmbientContext};
use crate::error::{LangSmithError, Result};
use crate::models::operation::RunFields;
use crate::models::run::{Run, RunType};
use crate::serialize::{feedback_to_operation, run_to_patch_operation, run_to_post_operation};
use crate::upload::Uploader;
use crate::worker::{WorkerPool, WorkerShared};

/// Public entry point: builds runs, enqueues their create/update/feedback
/// operations, and owns the background ingestion pipeline's lifetime.
///
/// Cloning a [`Client`] is cheap (it's an `Arc` handle) and every clone
/// shares the same queue, worker pool, and metrics. The worker pool only
/// holds a [`std::sync::Weak`] reference to the `alive` flag below, so it
/// winds down once every `Client` handle has been dropped (spec §4.6).
#[derive(Clone)]
pub struct Client {
    shared: Arc<WorkerShared>,
    pool: Arc<WorkerPool>,
    alive: Arc<AtomicBool>,
}

impl Client {
    /// Builds a client from environment-loaded config (spec §4.10). Raises
    /// immediately on a configuration failure (spec §7): missing API key,
    /// most commonly.
    pub fn from_env() -> Result<Self> {
        Self::with_config(Config::from_env()?)
    }

    pub fn with_config(config: Config) -> Result<Self> {
        if config.tracing_enabled && config.endpoint.starts_with("https://") && config.api_key.is_empty() {
            return Err(LangSmithError::Config(
                "api_key is required when tracing_enabled and endpoint is remote".to_string(),
            ));
        }

        let buffer = Arc::new(OpBuffer::new(config.queue_byte_cap));
        let compressor = Arc::new(Compressor::new(config.compression_level)?);
        let uploader = Arc::new(Uploader::new(&config));
        let shared = WorkerShared::new(buffer, compressor, uploader, config);
        let alive = Arc::new(AtomicBool::new(true));
        let pool = Arc::new(WorkerPool::spawn(shared.clone(), Arc::downgrade(&alive)));

        Ok(Self { shared, pool, alive })
    }

    pub fn config(&self) -> Config {
        self.shared.config()
    }

    /// Merges a server-advertised `batch_ingest_config` blob into the
    /// running config (spec §9): the next drain/scale decision and flush
    /// boundary check pick up the new values immediately.
    pub fn apply_ingest_config(&self, ingest: &IngestConfig) {
        self.shared.merge_ingest_config(ingest);
    }

    /// Enqueues an operation, suspending the caller if the byte-cap is
    /// already exhausted (spec §5 / §8 scenario S3). A disabled client is
    /// a no-op, matching `tracing_enabled`'s "master on/off" contract
    /// (spec §4.10).
    async fn enqueue(&self, operation: crate::models::operation::Operation, approx_bytes: usize) {
        if !self.shared.config().tracing_enabled {
            return;
        }
        let _ = self.shared.buffer.push(operation, approx_bytes).await;
    }

    fn approx_bytes(fields: &RunFields) -> usize {
        let mut size = fields.header.to_string().len();
        if let Some(v) = &fields.inputs {
            size += v.to_string().len();
        }
        if let Some(v) = &fields.outputs {
            size += v.to_string().len();
        }
        if let Some(v) = &fields.events {
            size += v.to_string().len();
        }
        for (_, attachment) in &fields.attachments {
            size += attachment.data.len();
        }
        size.max(1)
    }

    /// Applies the ambient context (current parent, project, tags,
    /// metadata) to a freshly built run, then enqueues one `PostRun` per
    /// active replica (spec §4.8: a run with no replicas configured still
    /// emits exactly one operation, to its own project).
    async fn finalize_and_post(&self, mut run: Run) -> Run {
        let ctx = context::current();
        if run.parent_run_id.is_none() {
            if let Some(parent) = &ctx.parent {
                run.parent_run_id = Some(parent.id);
                run.trace_id = Some(parent.trace_id);
                run.dotted_order = Some(format!("{}.{}", parent.dotted_order, run.own_segment()));
            }
        }
        run.ensure_root_identity();
        if run.session_name.is_none() {
            run.session_name = ctx.project.clone().or_else(|| self.shared.config().project.clone());
        }
        for tag in &ctx.tags {
            if !run.tags.contains(tag) {
                run.tags.push(tag.clone());
            }
        }
        for (k, v) in ctx.metadata.clone() {
            run.extra.entry("metadata".to_string()).or_insert_with(|| Value::Object(Default::default()));
            if let Some(Value::Object(map)) = run.extra.get_mut("metadata") {
                map.insert(k, v);
            }
        }

        self.post_with_replicas(&run, &ctx).await;
        run
    }

    async fn post_with_replicas(&self, run: &Run, ctx: &AmbientContext) {
        let config = self.shared.config();
        let hide_inputs = config.hide_inputs;
        let hide_outputs = config.hide_outputs;

        if ctx.replicas.is_empty() {
            if let Ok(op) = run_to_post_operation(run, hide_inputs, hide_outputs) {
                let bytes = Self::approx_bytes_of(&op);
                self.enqueue(op, bytes).await;
            }
            return;
        }

        for replica in &ctx.replicas {
            let Ok(op) = run_to_post_operation(run, hide_inputs, hide_outputs) else { continue };
            let crate::models::operation::Operation::PostRun(mut fields) = op else { unreachable!() };
            if replica.reroot {
                context::reroot_for_replica(&mut fields, &replica.project);
            } else if let Some(obj) = fields.header.as_object_mut() {
                obj.insert("session_name".to_string(), Value::String(replica.project.clone()));
            }
            let bytes = Self::approx_bytes(&fields);
            self.enqueue(crate::models::operation::Operation::PostRun(fields), bytes)
                .await;
        }
    }

    fn approx_bytes_of(op: &crate::models::operation::Operation) -> usize {
        match op {
            crate::models::operation::Operation::PostRun(f)
            | crate::models::operation::Operation::PatchRun(f) => Self::approx_bytes(f),
            crate::models::operation::Operation::PostFeedback { body, .. } => body.to_string().len().max(1),
        }
    }

    /// Builds a root run (or a child, if called within a `context::trace`
    /// scope carrying a parent) and enqueues its `PostRun` (spec §4.9).
    /// Suspends under backpressure (spec §8 scenario S3) rather than
    /// raising or silently dropping the operation.
    pub async fn create_run(&self, name: impl Into<String>, run_type: RunType, inputs: Value) -> Run {
        let run = Run::new(name, run_type, inputs);
        self.finalize_and_post(run).await
    }

    /// Enqueues a `PatchRun` reflecting `run`'s current end-state fields
    /// (spec §4.9). Callers are expected to have called [`Run::end`] (or
    /// otherwise mutated `run`) before calling this.
    pub async fn update_run(&self, run: &Run) {
        let config = self.shared.config();
        let hide_inputs = config.hide_inputs;
        let hide_outputs = config.hide_outputs;
        if let Ok(op) = run_to_patch_operation(run, hide_inputs, hide_outputs) {
            let bytes = Self::approx_bytes_of(&op);
            self.enqueue(op, bytes).await;
        }
    }

    /// Enqueues a `PostFeedback` operation (spec §4.9).
    pub async fn create_feedback(
        &self,
        run_id: Uuid,
        trace_id: Uuid,
        dotted_order: String,
        key: impl Into<String>,
        score: Option<f64>,
        value: Option<Value>,
        comment: Option<String>,
    ) {
        let body = serde_json::json!({
            "run_id": run_id,
            "trace_id": trace_id,
            "key": key.into(),
            "score": score,
            "value": value,
            "comment": comment,
        });
        let op = feedback_to_operation(run_id, trace_id, dotted_order, body);
        let bytes = Self::approx_bytes_of(&op);
        self.enqueue(op, bytes).await;
    }

    /// Waits for the queue to drain and all in-flight uploads to settle
    /// (spec §4.9). Never raises, even if some batches were dropped along
    /// the way — check [`Client::pending_drops`] afterward if that matters.
    pub async fn flush(&self) {
        self.pool.flush().await;
    }

    /// Number of operations that could not be delivered (rejected or gave
    /// up retrying), visible without the pipeline ever raising into the
    /// producing thread (spec §7).
    pub fn pending_drops(&self) -> u64 {
        self.shared.metrics.operations_dropped()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending_count()
    }

    /// Signals shutdown: the natural path is simply dropping every `Client`
    /// handle, which lets the worker pool's weak reference to `alive` fail
    /// to upgrade and trigger its own drain-then-exit. This method exists
    /// for callers that want to force that drain synchronously without
    /// waiting for every clone to go out of scope.
    pub async fn cleanup(&self) {
        self.alive.store(false, std::sync::atomic::Ordering::Release);
        self.pool.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> Config {
        let mut c = Config::builder("http://127.0.0.1:0", "test-key");
        c.tracing_enabled = true;
        c.batch_size_limit = 10;
        c
    }

    #[tokio::test]
    async fn create_run_assigns_root_identity() {
        let client = Client::with_config(test_config()).unwrap();
        let run = client.create_run("root", RunType::Chain, json!({"q": 1})).await;
        assert_eq!(run.trace_id, Some(run.id));
        assert!(run.dotted_order.is_some());
        client.cleanup().await;
    }

    #[tokio::test]
    async fn disabled_tracing_does_not_enqueue() {
        let mut config = test_config();
        config.tracing_enabled = false;
        let client = Client::with_config(config).unwrap();
        client.create_run("root", RunType::Chain, json!({})).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn child_run_created_inside_trace_scope_inherits_parent() {
        let client = Client::with_config(test_config()).unwrap();
        let root = client.create_run("root", RunType::Chain, json!({})).await;

        let ctx = AmbientContext {
            parent: Some(context::ParentStub {
                id: root.id,
                trace_id: root.trace_id.unwrap(),
                dotted_order: root.dotted_order.clone().unwrap(),
            }),
            ..Default::default()
        };
        let child = context::trace(ctx, async {
            client.create_run("child", RunType::Llm, json!({})).await
        })
        .await;

        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_run_id, Some(root.id));
        assert!(child
            .dotted_order
            .unwrap()
            .starts_with(&format!("{}.", root.dotted_order.unwrap())));
        client.cleanup().await;
    }
}
