//! Wire-format part builder shared by the compressor (which frames parts
//! into the zstd stream) and the uploader (which builds the multipart
//! request for a batch that didn't need a mid-stream flush).
//!
//! Each [`Operation`] becomes one or more named parts per spec §6.1. The
//! "trace context" summary line is accumulated alongside so both the
//! compressor and uploader can produce the trailing
//! `trace=<id>,id=<id>; ...` header without a second pass over the batch.

use serde_json::Value;

use crate::models::operation::Operation;

/// One multipart body part: `(part_name, content_type, body_bytes)`.
pub struct Part {
    pub name: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// The parts for one operation, plus its `trace=...,id=...` context
/// fragment for the trailing summary header.
pub struct PartsAndContext {
    pub parts: Vec<Part>,
    pub context: String,
}

fn json_part(name: String, value: &Value) -> Part {
    Part {
        name,
        content_type: "application/json".to_string(),
        body: serde_json::to_vec(value).unwrap_or_default(),
    }
}

/// Converts one [`Operation`] into its wire parts, per spec §6.1:
/// - `{op}.{id}` — header JSON
/// - `{op}.{id}.inputs` / `.outputs` / `.events` — detachable fields, if set
/// - `attachment.{id}.{key}` — raw attachment bytes
/// - `feedback.{id}` — feedback body JSON
pub fn operation_to_parts(op: &Operation) -> PartsAndContext {
    match op {
        Operation::PostRun(fields) | Operation::PatchRun(fields) => {
            let op_name = match op {
                Operation::PostRun(_) => "post",
                _ => "patch",
            };
            let mut parts = vec![json_part(format!("{op_name}.{}", fields.id), &fields.header)];
            for (key, value) in [
                ("inputs", &fields.inputs),
                ("outputs", &fields.outputs),
                ("events", &fields.events),
            ] {
                if let Some(v) = value {
                    parts.push(json_part(format!("{op_name}.{}.{key}", fields.id), v));
                }
            }
            for (name, attachment) in &fields.attachments {
                parts.push(Part {
                    name: format!("attachment.{}.{name}", fields.id),
                    content_type: attachment.mime_type.clone(),
                    body: attachment.data.clone(),
                });
            }
            PartsAndContext {
                parts,
                context: format!("trace={},id={}", fields.trace_id, fields.id),
            }
        }
        Operation::PostFeedback {
            id, trace_id, body, ..
        } => PartsAndContext {
            parts: vec![json_part(format!("feedback.{id}"), body)],
            context: format!("trace={trace_id},id={id}"),
        },
    }
}

/// Builds the trailing `trace-context` summary header value for a batch.
pub fn trace_context_header(contexts: &[String]) -> String {
    contexts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::operation::RunFields;
    use serde_json::json;
    use uuid::Uuid;

    fn fields() -> RunFields {
        RunFields {
            id: Uuid::nil(),
            trace_id: Uuid::nil(),
            header: json!({"name": "x"}),
            inputs: Some(json!({"a": 1})),
            outputs: None,
            events: None,
            attachments: vec![],
            dotted_order: "x".to_string(),
        }
    }

    #[test]
    fn post_run_produces_header_and_inputs_parts() {
        let op = Operation::PostRun(fields());
        let result = operation_to_parts(&op);
        let names: Vec<_> = result.parts.iter().map(|p| p.name.clone()).collect();
        assert!(names.contains(&format!("post.{}", Uuid::nil())));
        assert!(names.contains(&format!("post.{}.inputs", Uuid::nil())));
        assert!(!names.iter().any(|n| n.ends_with(".outputs")));
    }

    #[test]
    fn attachment_parts_use_stored_mime_type() {
        let mut f = fields();
        f.attachments.push((
            "img".to_string(),
            crate::models::run::Attachment {
                mime_type: "image/png".to_string(),
                data: vec![1, 2, 3],
            },
        ));
        let op = Operation::PostRun(f);
        let result = operation_to_parts(&op);
        let att = result
            .parts
            .iter()
            .find(|p| p.name.contains("attachment"))
            .unwrap();
        assert_eq!(att.content_type, "image/png");
        assert_eq!(att.body, vec![1, 2, 3]);
    }
}
