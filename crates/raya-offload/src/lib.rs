//! Raya Offload Runtime
//!
//! Lets lightweight cooperatively-scheduled tasks (light-tasks) run blocking
//! work without stalling the threads that schedule them:
//! - IO worker pool (fixed set of OS threads behind a FIFO queue)
//! - Offload executor (`submit` returns a future immediately)
//! - Promise/future bridge with race-free continuation registration
//! - Work-stealing light-task scheduler with timers
//! - Runtime tying one scheduler, one pool and one executor together

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod executor;
pub mod pool;
pub mod runtime;
pub mod scheduler;

pub use bridge::{promise, Continuation, FutureStatus, Promise, PromiseFuture, Timeout};
pub use config::{
    ConfigError, PoolConfig, QueuePolicy, RuntimeConfig, SchedulerConfig, ShutdownPolicy,
};
pub use error::{OffloadError, OffloadResult, WorkError};
pub use executor::OffloadExecutor;
pub use pool::{InlineQueue, PoolStats, WorkId, WorkItem, WorkOutcome, WorkQueue, WorkerPool};
pub use runtime::Runtime;
pub use scheduler::{
    is_worker_thread, sleep, yield_now, Handle, JoinHandle, Scheduler, SchedulerStats, Sleep,
    TaskId, TaskState, YieldNow,
};
