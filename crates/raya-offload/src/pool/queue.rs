//! The submission seam between an executor and whatever runs its work

use super::item::{WorkId, WorkItem, WorkOutcome};
use crate::error::OffloadResult;
use std::sync::atomic::{AtomicU64, Ordering};

/// Something that accepts work items
///
/// `WorkerPool` is the production implementation. An implementation must
/// either take ownership of the item (and eventually run or drop it) or
/// reject it with an error, never both.
pub trait WorkQueue: Send + Sync {
    /// Queue `item` for execution
    fn enqueue(&self, item: WorkItem) -> OffloadResult<WorkId>;
}

/// Runs every item immediately on the submitting thread
///
/// Useful as a stand-in for a pool in tests: a submitted future is already
/// fulfilled when `submit` returns.
#[derive(Debug, Default)]
pub struct InlineQueue {
    executed: AtomicU64,
    failed: AtomicU64,
}

impl InlineQueue {
    /// New inline queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items run so far
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Number of items that failed
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl WorkQueue for InlineQueue {
    fn enqueue(&self, item: WorkItem) -> OffloadResult<WorkId> {
        let id = item.id();
        if let WorkOutcome::Failed(_) = item.run() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }
}
