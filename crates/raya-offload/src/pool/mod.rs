//! IO worker pool
//!
//! A fixed set of OS threads pulling work items from one shared FIFO queue.
//! Blocking calls (file and socket IO, sleeps, CPU-heavy loops) belong here,
//! never on a scheduler worker thread.

mod item;
mod queue;
mod worker_pool;

pub use item::{WorkId, WorkItem, WorkOutcome};
pub use queue::{InlineQueue, WorkQueue};
pub use worker_pool::{PoolStats, WorkerPool};
