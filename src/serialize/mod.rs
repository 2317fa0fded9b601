//! Turns a [`Run`] snapshot into the wire-ready [`Operation`]: header JSON
//! split away from the detachable `inputs`/`outputs`/`events` fields, with
//! a depth-guarded value walk standing in for the upstream's identity-set
//! cycle detection (`serde_json::Value` is an owned tree, not a graph, so
//! true reference cycles can't occur here — the guard exists for
//! pathologically deep user-supplied structures instead).

use serde_json::{Map, Value};

use crate::models::operation::{Operation, RunFields};
use crate::models::run::Run;

const MAX_VALUE_DEPTH: usize = 64;

/// Walks a JSON value, substituting `"<cycle>"` for anything nested past
/// [`MAX_VALUE_DEPTH`], mirroring the upstream's `"<cycle>"` placeholder
/// for its identity-tracked cycle guard.
pub fn guard_depth(value: Value) -> Value {
    fn walk(value: Value, depth: usize) -> Value {
        if depth >= MAX_VALUE_DEPTH {
            return Value::String("<cycle>".to_string());
        }
        match value {
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| walk(v, depth + 1)).collect())
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, walk(v, depth + 1));
                }
                Value::Object(out)
            }
            other => other,
        }
    }
    walk(value, 0)
}

/// The header/detachable split of one run snapshot, before it's wrapped
/// into an [`Operation`].
pub struct RunPayload {
    pub header: Value,
    pub inputs: Option<Value>,
    pub outputs: Option<Value>,
    pub events: Option<Value>,
}

/// Splits a run into its header and detachable fields, honoring
/// `hide_inputs`/`hide_outputs` (spec §4.10) by dropping those fields
/// before they ever reach the buffer.
pub fn split_run_payload(run: &Run, hide_inputs: bool, hide_outputs: bool) -> crate::error::Result<RunPayload> {
    let mut header = serde_json::to_value(run)?;
    let header_map = header
        .as_object_mut()
        .expect("Run always serializes to a JSON object");

    let inputs = header_map.remove("inputs");
    let outputs = header_map.remove("outputs");
    let events = header_map.remove("events");

    Ok(RunPayload {
        header,
        inputs: if hide_inputs { None } else { inputs.map(guard_depth) },
        outputs: if hide_outputs { None } else { outputs.filter(|v| !v.is_null()).map(guard_depth) },
        events: events.filter(|v| v.as_array().is_some_and(|a| !a.is_empty())).map(guard_depth),
    })
}

fn run_fields(run: &Run, hide_inputs: bool, hide_outputs: bool) -> crate::error::Result<RunFields> {
    let payload = split_run_payload(run, hide_inputs, hide_outputs)?;
    let attachments = run
        .attachments
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(RunFields {
        id: run.id,
        trace_id: run.trace_id.unwrap_or(run.id),
        header: payload.header,
        inputs: payload.inputs,
        outputs: payload.outputs,
        events: payload.events,
        attachments,
        dotted_order: run.dotted_order.clone().unwrap_or_else(|| run.own_segment()),
    })
}

/// Builds the `PostRun` operation for a freshly started run.
pub fn run_to_post_operation(
    run: &Run,
    hide_inputs: bool,
    hide_outputs: bool,
) -> crate::error::Result<Operation> {
    Ok(Operation::PostRun(run_fields(run, hide_inputs, hide_outputs)?))
}

/// Builds the `PatchRun` operation for a finished (or otherwise updated) run.
pub fn run_to_patch_operation(
    run: &Run,
    hide_inputs: bool,
    hide_outputs: bool,
) -> crate::error::Result<Operation> {
    Ok(Operation::PatchRun(run_fields(run, hide_inputs, hide_outputs)?))
}

/// Builds the `PostFeedback` operation for a feedback submission.
pub fn feedback_to_operation(
    run_id: uuid::Uuid,
    trace_id: uuid::Uuid,
    dotted_order: String,
    body: Value,
) -> Operation {
    Operation::PostFeedback {
        id: run_id,
        trace_id,
        body: guard_depth(body),
        dotted_order,
    }
}
