use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::id;

/// The kind of operation a [`Run`] represents, mirroring the ingest
/// backend's `run_type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Chain,
    Llm,
    Tool,
    Retriever,
    Embedding,
    Prompt,
    Parser,
}

impl RunType {
    pub fn as_str(&self) -> &str {
        match self {
            RunType::Chain => "chain",
            RunType::Llm => "llm",
            RunType::Tool => "tool",
            RunType::Retriever => "retriever",
            RunType::Embedding => "embedding",
            RunType::Prompt => "prompt",
            RunType::Parser => "parser",
        }
    }
}

/// One streaming event attached to a run (token deltas, tool progress, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub name: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub kwargs: Value,
}

/// An opaque binary payload uploaded alongside a run under a named key.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// A run: one span in a trace. See spec §3 for the full invariant list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "run_type")]
    pub run_type: RunType,
    pub inputs: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(rename = "start_time")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "end_time", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(rename = "parent_run_id", skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    #[serde(rename = "trace_id", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    #[serde(rename = "dotted_order", skip_serializing_if = "Option::is_none")]
    pub dotted_order: Option<String>,
    #[serde(rename = "session_id", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "session_name", skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(rename = "thread_id", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(
        rename = "reference_example_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub reference_example_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub extra: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<RunEvent>,

    #[serde(skip)]
    pub attachments: HashMap<String, Attachment>,
}

impl Run {
    pub fn new(name: impl Into<String>, run_type: RunType, inputs: Value) -> Self {
        Self::new_at(name, run_type, inputs, Utc::now())
    }

    /// Builds a run whose `id` timestamp bits match `start_time`, per the
    /// invariant that a run's UUIDv7 millisecond equals
    /// `floor(start_time_ns / 1e6)`.
    pub fn new_at(
        name: impl Into<String>,
        run_type: RunType,
        inputs: Value,
        start_time: DateTime<Utc>,
    ) -> Self {
        let ns = start_time.timestamp_nanos_opt().unwrap_or_default() as u128;
        let id = id::uuid7_at(ns);

        Self {
            id,
            name: name.into(),
            run_type,
            inputs,
            outputs: None,
            start_time,
            end_time: None,
            parent_run_id: None,
            trace_id: None,
            dotted_order: None,
            session_id: None,
            session_name: None,
            thread_id: None,
            reference_example_id: None,
            error: None,
            tags: Vec::new(),
            extra: HashMap::new(),
            events: Vec::new(),
            attachments: HashMap::new(),
        }
    }

    /// Formats this run's own dotted_order segment:
    /// `<start_time_utc_YYYYMMDDTHHMMSSffffffZ><id_hex_nodashes>`.
    pub fn own_segment(&self) -> String {
        let timestamp = self.start_time.format("%Y%m%dT%H%M%S");
        let micros = self.start_time.timestamp_subsec_micros();
        let id_hex = self.id.simple().to_string();
        format!("{timestamp}{micros:06}Z{id_hex}")
    }

    /// Computes this run's full dotted_order given its parent's (if any).
    pub fn generate_dotted_order(&self, parent_dotted_order: Option<&str>) -> String {
        match parent_dotted_order {
            Some(parent) => format!("{parent}.{}", self.own_segment()),
            None => self.own_segment(),
        }
    }

    /// Derives a child run: fresh id timestamped at `start_time`, inherited
    /// `trace_id`, `dotted_order` prefix, `thread_id`, `session_name`.
    pub fn create_child(
        &self,
        name: impl Into<String>,
        run_type: RunType,
        inputs: Value,
    ) -> Self {
        self.create_child_at(name, run_type, inputs, Utc::now())
    }

    pub fn create_child_at(
        &self,
        name: impl Into<String>,
        run_type: RunType,
        inputs: Value,
        start_time: DateTime<Utc>,
    ) -> Self {
        let mut child = Self::new_at(name, run_type, inputs, start_time);
        child.parent_run_id = Some(self.id);
        child.trace_id = Some(self.trace_id.unwrap_or(self.id));
        child.dotted_order = Some(child.generate_dotted_order(self.dotted_order.as_deref()));
        child.thread_id = self.thread_id.clone();
        child.session_name = self.session_name.clone();
        child.session_id = self.session_id.clone();
        child
    }

    /// Ensures `trace_id`/`dotted_order` are set, for a run created without
    /// a parent (i.e. the root of a new trace).
    pub fn ensure_root_identity(&mut self) {
        if self.trace_id.is_none() {
            self.trace_id = Some(self.id);
        }
        if self.dotted_order.is_none() {
            self.dotted_order = Some(self.generate_dotted_order(None));
        }
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn push_event(&mut self, name: impl Into<String>, kwargs: Value) {
        self.events.push(RunEvent {
            name: name.into(),
            time: Utc::now(),
            kwargs,
        });
    }

    /// Terminal update. Last call wins; does not enqueue by itself.
    pub fn end(&mut self, outputs: Option<Value>, error: Option<String>) {
        self.end_time = Some(Utc::now());
        if outputs.is_some() {
            self.outputs = outputs;
        }
        if error.is_some() {
            self.error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_order_is_a_single_segment_for_roots() {
        let mut run = Run::new("root", RunType::Chain, json!({}));
        run.ensure_root_identity();
        assert!(!run.dotted_order.as_ref().unwrap().contains('.'));
    }

    #[test]
    fn child_dotted_order_is_prefixed_by_parent() {
        let mut parent = Run::new("root", RunType::Chain, json!({}));
        parent.ensure_root_identity();
        let child = parent.create_child("child", RunType::Llm, json!({}));
        let parent_dotted = parent.dotted_order.clone().unwrap();
        let child_dotted = child.dotted_order.clone().unwrap();
        assert!(child_dotted.starts_with(&format!("{parent_dotted}.")));
        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_run_id, Some(parent.id));
    }

    #[test]
    fn run_id_timestamp_matches_start_time() {
        let start = Utc::now();
        let run = Run::new_at("x", RunType::Tool, json!({}), start);
        let ns = start.timestamp_nanos_opt().unwrap() as u128;
        assert_eq!(id::timestamp_ms_of(&run.id), (ns / 1_000_000) as u64);
    }

    #[test]
    fn grandchild_dotted_order_chains_through_parent() {
        let mut root = Run::new("root", RunType::Chain, json!({}));
        root.ensure_root_identity();
        let child = root.create_child("child", RunType::Chain, json!({}));
        let grandchild = child.create_child("grandchild", RunType::Tool, json!({}));
        assert!(grandchild
            .dotted_order
            .as_ref()
            .unwrap()
            .starts_with(child.dotted_order.as_ref().unwrap()));
        assert_eq!(grandchild.trace_id, root.trace_id);
    }
}
