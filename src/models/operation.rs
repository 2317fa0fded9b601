use serde_json::Value;
use uuid::Uuid;

use super::run::Attachment;

/// The kind of mutation an [`Operation`] represents. Used as the
/// coalescing/ordering key in the buffer (`kind_rank(post) < kind_rank(patch)
/// < kind_rank(feedback)`, per spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationKind {
    Post,
    Patch,
    Feedback,
}

impl OperationKind {
    pub fn rank(self) -> u8 {
        match self {
            OperationKind::Post => 0,
            OperationKind::Patch => 1,
            OperationKind::Feedback => 2,
        }
    }
}

/// One run-mutation fields bundle, shared by `PostRun` and `PatchRun`. The
/// serializer already split `header` away from the detachable fields
/// (`inputs`/`outputs`/`events`/`attachments`), per spec §3/§4.3.
#[derive(Debug, Clone)]
pub struct RunFields {
    pub id: Uuid,
    pub trace_id: Uuid,
    /// JSON of the run minus inputs/outputs/events/attachments.
    pub header: Value,
    pub inputs: Option<Value>,
    pub outputs: Option<Value>,
    pub events: Option<Value>,
    pub attachments: Vec<(String, Attachment)>,
    /// Sort key carried alongside the op so the buffer doesn't need to
    /// re-parse `header` to find it.
    pub dotted_order: String,
}

/// The serializer's output: one mutation sitting in the buffer.
#[derive(Debug, Clone)]
pub enum Operation {
    PostRun(RunFields),
    PatchRun(RunFields),
    PostFeedback {
        id: Uuid,
        trace_id: Uuid,
        body: Value,
        dotted_order: String,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::PostRun(_) => OperationKind::Post,
            Operation::PatchRun(_) => OperationKind::Patch,
            Operation::PostFeedback { .. } => OperationKind::Feedback,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Operation::PostRun(f) | Operation::PatchRun(f) => f.id,
            Operation::PostFeedback { id, .. } => *id,
        }
    }

    pub fn trace_id(&self) -> Uuid {
        match self {
            Operation::PostRun(f) | Operation::PatchRun(f) => f.trace_id,
            Operation::PostFeedback { trace_id, .. } => *trace_id,
        }
    }

    pub fn dotted_order(&self) -> &str {
        match self {
            Operation::PostRun(f) | Operation::PatchRun(f) => &f.dotted_order,
            Operation::PostFeedback { dotted_order, .. } => dotted_order,
        }
    }

    /// The ordering key of spec §4.4: `(dotted_order, kind_rank)`.
    pub fn sort_key(&self) -> (String, u8) {
        (self.dotted_order().to_string(), self.kind().rank())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_rank_orders_post_before_patch_before_feedback() {
        assert!(OperationKind::Post.rank() < OperationKind::Patch.rank());
        assert!(OperationKind::Patch.rank() < OperationKind::Feedback.rank());
    }
}
