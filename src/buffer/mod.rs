//! In-process operation queue between producer code (`Client`) and the
//! worker pool. Implements the upstream's drain protocol — wait up to
//! 250ms for the first item, then keep draining with a 50ms timeout until
//! the batch limit is hit or the queue goes quiet — plus the byte-cap
//! backpressure gate of spec §4.4/§5.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{LangSmithError, Result};
use crate::models::operation::{Operation, RunFields};

const FIRST_ITEM_TIMEOUT: Duration = Duration::from_millis(250);
const SUBSEQUENT_ITEM_TIMEOUT: Duration = Duration::from_millis(50);

/// Merges a `PatchRun` into its matching in-batch `PostRun`: non-null
/// header fields override, detachable fields replace when present,
/// attachments accumulate. Grounded in
/// `combine_serialized_queue_operations`'s merge rule.
fn merge_patch_into_post(post: &mut RunFields, patch: RunFields) {
    if let (Some(post_obj), Some(patch_obj)) =
        (post.header.as_object_mut(), patch.header.as_object())
    {
        for (k, v) in patch_obj {
            if !v.is_null() {
                post_obj.insert(k.clone(), v.clone());
            }
        }
    }
    if patch.inputs.is_some() {
        post.inputs = patch.inputs;
    }
    if patch.outputs.is_some() {
        post.outputs = patch.outputs;
    }
    if patch.events.is_some() {
        post.events = patch.events;
    }
    post.attachments.extend(patch.attachments);
}

/// Coalesces post+patch pairs sharing an id within one drained batch, then
/// sorts the result by `(dotted_order, kind_rank)` (spec §4.4).
pub fn combine(ops: Vec<Operation>) -> Vec<Operation> {
    let mut posts: HashMap<Uuid, RunFields> = HashMap::new();
    let mut passthrough: Vec<Operation> = Vec::new();

    for op in ops {
        match op {
            Operation::PostRun(fields) => {
                posts.insert(fields.id, fields);
            }
            Operation::PatchRun(patch) => {
                if let Some(post) = posts.get_mut(&patch.id) {
                    merge_patch_into_post(post, patch);
                } else {
                    passthrough.push(Operation::PatchRun(patch));
                }
            }
            other => passthrough.push(other),
        }
    }

    let mut combined: Vec<Operation> = posts.into_values().map(Operation::PostRun).collect();
    combined.extend(passthrough);
    combined.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    combined
}

/// The shared producer/consumer queue. Each enqueued operation reserves a
/// budget permit sized to its approximate serialized byte count; permits
/// are only released once the batch that carried them has been fully
/// resolved (uploaded, or given up on), matching the "decrements exactly
/// once" behavior of spec §8 scenario S6.
pub struct OpBuffer {
    sender: mpsc::UnboundedSender<(Operation, u32)>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<(Operation, u32)>>,
    budget: Arc<Semaphore>,
    cap_permits: u32,
    /// Number of operations pushed but not yet drained. Distinct from the
    /// byte-budget semaphore: this is the `queue.size` spec §4.6's
    /// scale-up trigger compares against.
    queued: AtomicUsize,
}

impl OpBuffer {
    pub fn new(queue_byte_cap: u64) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cap_permits = queue_byte_cap.min(u32::MAX as u64) as u32;
        Self {
            sender,
            receiver: AsyncMutex::new(receiver),
            budget: Arc::new(Semaphore::new(cap_permits as usize)),
            cap_permits,
            queued: AtomicUsize::new(0),
        }
    }

    /// Enqueues an operation, suspending if the byte cap is already
    /// exhausted (spec §5: "queue put when byte-cap is reached").
    pub async fn push(&self, op: Operation, approx_bytes: usize) -> Result<()> {
        let permits = approx_bytes.clamp(1, self.cap_permits as usize) as u32;
        let permit = self
            .budget
            .clone()
            .acquire_many_owned(permits)
            .await
            .map_err(|_| LangSmithError::Backpressure)?;
        permit.forget();
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send((op, permits))
            .map_err(|_| LangSmithError::Other("operation buffer is closed".to_string()))
    }

    /// Enqueues without waiting: fails fast with [`LangSmithError::Backpressure`]
    /// if the byte cap is already exhausted, for callers that opted out of
    /// blocking (spec §4.4).
    pub fn try_push(&self, op: Operation, approx_bytes: usize) -> Result<()> {
        let permits = approx_bytes.clamp(1, self.cap_permits as usize) as u32;
        let permit = self
            .budget
            .clone()
            .try_acquire_many_owned(permits)
            .map_err(|_| LangSmithError::Backpressure)?;
        permit.forget();
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send((op, permits))
            .map_err(|_| LangSmithError::Other("operation buffer is closed".to_string()))
    }

    /// Approximate number of operations pushed but not yet drained.
    pub fn queued_len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Drains up to `limit` operations, blocking up to 250ms for the first
    /// one and 50ms for each subsequent one. Returns the coalesced,
    /// priority-sorted batch plus the total budget permits it holds.
    pub async fn drain(&self, limit: usize) -> (Vec<Operation>, u32) {
        let mut receiver = self.receiver.lock().await;
        let mut items = Vec::new();
        let mut bytes_held = 0u32;

        match timeout(FIRST_ITEM_TIMEOUT, receiver.recv()).await {
            Ok(Some((op, permits))) => {
                items.push(op);
                bytes_held += permits;
                self.queued.fetch_sub(1, Ordering::AcqRel);
            }
            _ => return (Vec::new(), 0),
        }

        while items.len() < limit {
            match timeout(SUBSEQUENT_ITEM_TIMEOUT, receiver.recv()).await {
                Ok(Some((op, permits))) => {
                    items.push(op);
                    bytes_held += permits;
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                }
                _ => break,
            }
        }

        (combine(items), bytes_held)
    }

    /// Releases budget permits held by a batch that has finished uploading
    /// (successfully or after giving up).
    pub fn release(&self, permits: u32) {
        self.budget.add_permits(permits as usize);
    }

    pub fn available_budget(&self) -> usize {
        self.budget.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::run::RunType;
    use crate::models::Run;
    use crate::serialize::{run_to_patch_operation, run_to_post_operation};
    use serde_json::json;

    #[test]
    fn combine_merges_patch_into_matching_post() {
        let mut run = Run::new("root", RunType::Chain, json!({"a": 1}));
        run.ensure_root_identity();
        let post = run_to_post_operation(&run, false, false).unwrap();
        run.end(Some(json!({"b": 2})), None);
        let patch = run_to_patch_operation(&run, false, false).unwrap();

        let combined = combine(vec![post, patch]);
        assert_eq!(combined.len(), 1);
        match &combined[0] {
            Operation::PostRun(fields) => {
                assert_eq!(fields.outputs, Some(json!({"b": 2})));
            }
            _ => panic!("expected a single coalesced PostRun"),
        }
    }

    #[test]
    fn combine_passes_through_orphan_patch() {
        let mut run = Run::new("root", RunType::Chain, json!({}));
        run.ensure_root_identity();
        run.end(Some(json!({})), None);
        let patch = run_to_patch_operation(&run, false, false).unwrap();
        let combined = combine(vec![patch]);
        assert_eq!(combined.len(), 1);
        assert!(matches!(combined[0], Operation::PatchRun(_)));
    }

    #[tokio::test]
    async fn push_then_drain_round_trips_an_operation() {
        let buffer = OpBuffer::new(1024 * 1024);
        let mut run = Run::new("root", RunType::Chain, json!({}));
        run.ensure_root_identity();
        let op = run_to_post_operation(&run, false, false).unwrap();
        buffer.push(op, 128).await.unwrap();

        let (drained, bytes_held) = buffer.drain(100).await;
        assert_eq!(drained.len(), 1);
        assert_eq!(bytes_held, 128);
        buffer.release(bytes_held);
        assert_eq!(buffer.available_budget(), 1024 * 1024);
    }

    #[tokio::test]
    async fn drain_respects_the_batch_limit() {
        let buffer = OpBuffer::new(1024 * 1024);
        for _ in 0..5 {
            let mut run = Run::new("root", RunType::Chain, json!({}));
            run.ensure_root_identity();
            let op = run_to_post_operation(&run, false, false).unwrap();
            buffer.push(op, 8).await.unwrap();
        }
        let (drained, _) = buffer.drain(3).await;
        assert_eq!(drained.len(), 3);
    }

    #[tokio::test]
    async fn push_suspends_once_budget_is_exhausted() {
        let buffer = Arc::new(OpBuffer::new(16));
        let mut run = Run::new("root", RunType::Chain, json!({}));
        run.ensure_root_identity();
        let op = run_to_post_operation(&run, false, false).unwrap();
        buffer.push(op, 16).await.unwrap();

        let buffer_clone = buffer.clone();
        let blocked = tokio::spawn(async move {
            let mut run = Run::new("child", RunType::Chain, json!({}));
            run.ensure_root_identity();
            let op = run_to_post_operation(&run, false, false).unwrap();
            buffer_clone.push(op, 8).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        buffer.release(16);
        blocked.await.unwrap();
    }

    #[tokio::test]
    async fn try_push_fails_fast_instead_of_blocking() {
        let buffer = OpBuffer::new(16);
        let mut run = Run::new("root", RunType::Chain, json!({}));
        run.ensure_root_identity();
        let op = run_to_post_operation(&run, false, false).unwrap();
        buffer.try_push(op, 16).unwrap();

        let mut run2 = Run::new("child", RunType::Chain, json!({}));
        run2.ensure_root_identity();
        let op2 = run_to_post_operation(&run2, false, false).unwrap();
        assert!(matches!(
            buffer.try_push(op2, 8),
            Err(LangSmithError::Backpressure)
        ));
    }

    #[tokio::test]
    async fn queued_len_tracks_pushes_and_drains() {
        let buffer = OpBuffer::new(1024);
        let mut run = Run::new("root", RunType::Chain, json!({}));
        run.ensure_root_identity();
        let op = run_to_post_operation(&run, false, false).unwrap();
        buffer.push(op, 8).await.unwrap();
        assert_eq!(buffer.queued_len(), 1);
        buffer.drain(10).await;
        assert_eq!(buffer.queued_len(), 0);
    }
}
