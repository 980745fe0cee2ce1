//! Units of blocking work

use crate::error::WorkError;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a submitted work item
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkId(u64);

static NEXT_WORK_ID: AtomicU64 = AtomicU64::new(1);

impl WorkId {
    /// Generate a new unique WorkId
    pub fn new() -> Self {
        WorkId(NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work-{}", self.0)
    }
}

/// How a work item ended; only feeds pool statistics and logs
#[derive(Debug)]
pub enum WorkOutcome {
    /// Ran to completion
    Completed,
    /// Returned an error or panicked
    Failed(WorkError),
}

type WorkFn = Box<dyn FnOnce() -> WorkOutcome + Send + 'static>;

/// An opaque callable queued on the worker pool
///
/// Dropping an item without running it drops everything it captured,
/// including the promise of its submitter.
pub struct WorkItem {
    id: WorkId,
    work: WorkFn,
}

impl WorkItem {
    /// Wrap a callable into a work item with a fresh id
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() -> WorkOutcome + Send + 'static,
    {
        Self {
            id: WorkId::new(),
            work: Box::new(work),
        }
    }

    /// Item id
    pub fn id(&self) -> WorkId {
        self.id
    }

    /// Run the callable; a panic becomes `WorkOutcome::Failed`
    pub fn run(self) -> WorkOutcome {
        let work = self.work;
        match catch_unwind(AssertUnwindSafe(work)) {
            Ok(outcome) => outcome,
            Err(payload) => WorkOutcome::Failed(WorkError::from_panic(payload)),
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem").field("id", &self.id).finish()
    }
}
