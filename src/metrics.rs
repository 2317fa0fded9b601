//! Background-failure accounting and log-deduplication, per spec §7:
//! "Background failures are logged once per distinct kind (log-deduplication
//! by message hash) to avoid log floods" and "`flush()` returns without
//! raising even if some batches failed; a subsequent `pending_count()` or
//! metrics probe exposes drops."
//!
//! Supersedes the teacher's `src/models/metrics.rs` (token/cost accounting),
//! which belonged to the LLM-wrapper layer this crate's scope excludes
//! (spec §1, "Deliberately out of scope").

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Counters a caller can poll after `flush()` to learn whether anything
/// was dropped in the background, without the pipeline ever raising into
/// the producing thread for a post-enqueue failure.
#[derive(Debug, Default)]
pub struct Metrics {
    pub batches_uploaded: AtomicU64,
    pub batches_rejected: AtomicU64,
    pub batches_gave_up: AtomicU64,
    pub operations_dropped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_uploaded(&self, op_count: usize) {
        self.batches_uploaded.fetch_add(1, Ordering::Relaxed);
        let _ = op_count;
    }

    pub fn record_rejected(&self, op_count: usize) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
        self.operations_dropped
            .fetch_add(op_count as u64, Ordering::Relaxed);
    }

    pub fn record_gave_up(&self, op_count: usize) {
        self.batches_gave_up.fetch_add(1, Ordering::Relaxed);
        self.operations_dropped
            .fetch_add(op_count as u64, Ordering::Relaxed);
    }

    pub fn operations_dropped(&self) -> u64 {
        self.operations_dropped.load(Ordering::Relaxed)
    }
}

fn hash_of(message: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    message.hash(&mut hasher);
    hasher.finish()
}

/// Logs `message` at `warn` level, but only the first time a given message
/// hash is seen for the lifetime of this [`LogDedup`] instance — backs the
/// "log background failures once per distinct kind" requirement so a
/// persistently failing batch doesn't flood the log.
pub struct LogDedup {
    seen: Mutex<HashSet<u64>>,
}

impl LogDedup {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Returns `true` the first time this message (by hash) is seen, and
    /// `false` on every subsequent occurrence.
    pub fn should_log(&self, message: &str) -> bool {
        self.seen.lock().insert(hash_of(message))
    }
}

impl Default for LogDedup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_track_drops_separately_from_successes() {
        let metrics = Metrics::new();
        metrics.record_uploaded(3);
        metrics.record_rejected(2);
        metrics.record_gave_up(1);
        assert_eq!(metrics.operations_dropped(), 3);
    }

    #[test]
    fn log_dedup_logs_distinct_messages_once_each() {
        let dedup = LogDedup::new();
        assert!(dedup.should_log("disk full"));
        assert!(!dedup.should_log("disk full"));
        assert!(dedup.should_log("connection refused"));
    }
}
