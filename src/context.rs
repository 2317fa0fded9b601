//! Ambient tracing context: the "current parent run" plus the
//! project/tags/metadata/replica set that apply to any run created within
//! a scope. A single task-local owns all of it (spec §9's open question:
//! the upstream keeps two copies in sync across `_context.py` and
//! `run_helpers.py`; here there is exactly one owner, this module).
//!
//! Grounded on the teacher's `src/tracing/context.rs` (`TraceContext`
//! builder) and `src/tracing/tracer.rs::with_context`, combined with
//! `original_source/.../_internal/_context.py`'s single-contextvar design.

use std::cell::RefCell;
use std::collections::HashMap;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::operation::RunFields;

/// A detached "stub" run reconstructed from propagation headers, or
/// carried forward in-process: enough identity to parent a child run.
#[derive(Debug, Clone)]
pub struct ParentStub {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub dotted_order: String,
}

/// One distributed-replica destination (spec §4.8).
#[derive(Debug, Clone)]
pub struct ReplicaSpec {
    pub project: String,
    pub reroot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AmbientContext {
    pub parent: Option<ParentStub>,
    pub project: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub replicas: Vec<ReplicaSpec>,
}

tokio::task_local! {
    static CONTEXT: RefCell<AmbientContext>;
}

/// Runs `body` with `ctx` as the ambient context; restored automatically
/// when `body` completes, including by panic, since the context only
/// exists for the span of this future's execution.
pub async fn trace<Fut, T>(ctx: AmbientContext, body: Fut) -> T
where
    Fut: std::future::Future<Output = T>,
{
    CONTEXT.scope(RefCell::new(ctx), body).await
}

/// Reads the current ambient context, or the default (no parent, no
/// project/tags/metadata/replicas) if called outside a `trace` scope.
pub fn current() -> AmbientContext {
    CONTEXT
        .try_with(|cell| cell.borrow().clone())
        .unwrap_or_default()
}

fn encode(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

/// Builds the `langsmith-trace` / `baggage` propagation headers for a run
/// about to cross a process boundary (spec §4.2/§6.2).
pub fn to_headers(trace_id: Uuid, dotted_order: &str, ctx: &AmbientContext) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(
        "langsmith-trace".to_string(),
        format!("{trace_id}.{dotted_order}"),
    );

    let mut baggage_parts = Vec::new();
    if !ctx.metadata.is_empty() {
        let json = Value::Object(ctx.metadata.clone()).to_string();
        baggage_parts.push(format!("langsmith-metadata={}", encode(&json)));
    }
    if !ctx.tags.is_empty() {
        baggage_parts.push(format!("langsmith-tags={}", encode(&ctx.tags.join(","))));
    }
    if let Some(project) = &ctx.project {
        baggage_parts.push(format!("langsmith-project={}", encode(project)));
    }
    if !ctx.replicas.is_empty() {
        let replicas_json = serde_json::to_string(
            &ctx.replicas
                .iter()
                .map(|r| serde_json::json!({"project": r.project, "reroot": r.reroot}))
                .collect::<Vec<_>>(),
        )
        .unwrap_or_default();
        baggage_parts.push(format!("langsmith-replicas={}", encode(&replicas_json)));
    }
    if !baggage_parts.is_empty() {
        headers.insert("baggage".to_string(), baggage_parts.join(","));
    }
    headers
}

fn last_dotted_segment(dotted_order: &str) -> String {
    dotted_order
        .rsplit('.')
        .next()
        .unwrap_or(dotted_order)
        .to_string()
}

/// Reconstructs an [`AmbientContext`] from incoming propagation headers.
/// The decoded parent becomes the immediate parent for any run created
/// within the handler's scope; a later `reroot` within that scope refers
/// to *this* parent, not whatever produced it upstream (spec §4.8,
/// "Nested rerooting across processes").
pub fn ambient_from_headers(headers: &HashMap<String, String>) -> AmbientContext {
    let mut ctx = AmbientContext::default();

    if let Some(trace_header) = headers.get("langsmith-trace") {
        if let Some((trace_id_str, dotted_order)) = trace_header.split_once('.') {
            if let Ok(trace_id) = Uuid::parse_str(trace_id_str) {
                let last_segment = last_dotted_segment(dotted_order);
                if last_segment.len() >= 32 {
                    let id_hex = &last_segment[last_segment.len() - 32..];
                    if let Ok(id) = Uuid::parse_str(id_hex) {
                        ctx.parent = Some(ParentStub {
                            id,
                            trace_id,
                            dotted_order: dotted_order.to_string(),
                        });
                    }
                }
            }
        }
    }

    if let Some(baggage) = headers.get("baggage") {
        for kv in baggage.split(',') {
            let Some((key, value)) = kv.split_once('=') else {
                continue;
            };
            let decoded = percent_decode_str(value).decode_utf8_lossy().to_string();
            match key {
                "langsmith-metadata" => {
                    if let Ok(Value::Object(map)) = serde_json::from_str(&decoded) {
                        ctx.metadata = map;
                    }
                }
                "langsmith-tags" => {
                    ctx.tags = decoded
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string())
                        .collect();
                }
                "langsmith-project" => ctx.project = Some(decoded),
                "langsmith-replicas" => {
                    if let Ok(list) = serde_json::from_str::<Vec<Value>>(&decoded) {
                        ctx.replicas = list
                            .into_iter()
                            .filter_map(|v| {
                                Some(ReplicaSpec {
                                    project: v.get("project")?.as_str()?.to_string(),
                                    reroot: v
                                        .get("reroot")
                                        .and_then(|r| r.as_bool())
                                        .unwrap_or(false),
                                })
                            })
                            .collect();
                    }
                }
                _ => {}
            }
        }
    }

    ctx
}

/// Rewrites `fields` in place for emission to a replica with `reroot =
/// true` (spec §4.8): clears the inherited parent, collapses the
/// dotted_order to this run's own segment, and resets `trace_id` to the
/// run's own id.
pub fn reroot_for_replica(fields: &mut RunFields, project: &str) {
    let own_segment = last_dotted_segment(&fields.dotted_order);
    if let Some(obj) = fields.header.as_object_mut() {
        obj.insert("parent_run_id".to_string(), Value::Null);
        obj.insert(
            "trace_id".to_string(),
            Value::String(fields.id.to_string()),
        );
        obj.insert(
            "dotted_order".to_string(),
            Value::String(own_segment.clone()),
        );
        obj.insert("session_name".to_string(), Value::String(project.to_string()));
    }
    fields.trace_id = fields.id;
    fields.dotted_order = own_segment;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn trace_scope_is_visible_inside_and_restored_after() {
        assert!(current().parent.is_none());
        let ctx = AmbientContext {
            project: Some("proj".to_string()),
            ..Default::default()
        };
        trace(ctx, async {
            assert_eq!(current().project.as_deref(), Some("proj"));
        })
        .await;
        assert!(current().project.is_none());
    }

    #[test]
    fn headers_round_trip_parent_identity() {
        let run_id = Uuid::nil();
        let trace_id = Uuid::max();
        let dotted_order = format!("20240101T000000000000Z{}", run_id.simple());
        let ctx = AmbientContext {
            project: Some("my-project".to_string()),
            tags: vec!["a".to_string(), "b".to_string()],
            metadata: {
                let mut m = Map::new();
                m.insert("k".to_string(), json!("v"));
                m
            },
            ..Default::default()
        };
        let headers = to_headers(trace_id, &dotted_order, &ctx);
        let decoded = ambient_from_headers(&headers);

        let parent = decoded.parent.unwrap();
        assert_eq!(parent.id, run_id);
        assert_eq!(parent.trace_id, trace_id);
        assert_eq!(decoded.project.as_deref(), Some("my-project"));
        assert_eq!(decoded.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(decoded.metadata.get("k"), Some(&json!("v")));
    }

    #[test]
    fn reroot_clears_parent_and_collapses_dotted_order() {
        let id = Uuid::nil();
        let mut fields = RunFields {
            id,
            trace_id: Uuid::max(),
            header: json!({"parent_run_id": Uuid::max().to_string(), "trace_id": Uuid::max().to_string()}),
            inputs: None,
            outputs: None,
            events: None,
            attachments: vec![],
            dotted_order: format!("parentsegment.{}", id.simple()),
        };
        reroot_for_replica(&mut fields, "replica-project");
        assert_eq!(fields.trace_id, id);
        assert_eq!(fields.dotted_order, id.simple().to_string());
        assert_eq!(fields.header.get("parent_run_id").unwrap(), &Value::Null);
        assert_eq!(
            fields.header.get("session_name").unwrap().as_str(),
            Some("replica-project")
        );
    }
}
