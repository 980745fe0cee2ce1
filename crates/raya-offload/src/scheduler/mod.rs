//! Light-task scheduler - Work-Stealing Cooperative Concurrency
//!
//! Light-tasks are futures multiplexed over a small set of worker threads.
//! A task yields only at an `.await` on something pending; the worker then
//! moves on to the next runnable task. Wakers push suspended tasks back onto
//! the global injector.

#[allow(clippy::module_inception)]
mod scheduler;
mod task;
mod timer;
mod worker;

pub use scheduler::{Handle, JoinHandle, Scheduler, SchedulerStats};
pub use task::{yield_now, TaskId, TaskState, YieldNow};
pub use timer::{sleep, Sleep};
pub use worker::is_worker_thread;
