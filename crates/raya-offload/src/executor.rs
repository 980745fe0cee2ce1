//! Offload executor: submit blocking work, get a future back

use crate::bridge::{promise, PromiseFuture};
use crate::error::{OffloadError, OffloadResult, WorkError};
use crate::pool::{WorkItem, WorkOutcome, WorkQueue, WorkerPool};
use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Handle for running blocking work on a worker pool
///
/// Cheap to clone; every clone submits to the same queue. `submit` never
/// blocks a light-task: it enqueues and returns the future immediately.
///
/// ```ignore
/// let executor = runtime.executor();
/// let written = executor
///     .submit_fallible(|| std::io::stdout().write(b"hello\n"))?
///     .await?;
/// ```
#[derive(Clone)]
pub struct OffloadExecutor {
    queue: Arc<dyn WorkQueue>,
}

impl OffloadExecutor {
    /// Executor over any work queue
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self { queue }
    }

    /// Executor over a worker pool
    pub fn from_pool(pool: Arc<WorkerPool>) -> Self {
        Self { queue: pool }
    }

    /// Run an infallible callable on the pool
    ///
    /// The future resolves to its return value, or to `WorkFailed` if it
    /// panics.
    pub fn submit<F, R>(&self, work: F) -> OffloadResult<PromiseFuture<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit_fallible(move || Ok::<R, Infallible>(work()))
    }

    /// Run a fallible callable on the pool
    ///
    /// An `Err` becomes `OffloadError::WorkFailed` with the original error
    /// kept as its source. Enqueue failures (`PoolShutdown`, `QueueFull`)
    /// come back here and no future is created.
    pub fn submit_fallible<F, R, E>(&self, work: F) -> OffloadResult<PromiseFuture<R>>
    where
        F: FnOnce() -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (promise, future) = promise();

        let item = WorkItem::new(move || {
            let result = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(WorkError::from_error(error)),
                Err(payload) => Err(WorkError::from_panic(payload)),
            };

            match result {
                Ok(value) => {
                    promise.resolve(value);
                    WorkOutcome::Completed
                }
                Err(error) => {
                    promise.reject(OffloadError::WorkFailed(error.clone()));
                    WorkOutcome::Failed(error)
                }
            }
        });

        let id = self.queue.enqueue(item)?;
        tracing::trace!(work = %id, "work submitted");
        Ok(future)
    }
}

impl fmt::Debug for OffloadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadExecutor").finish_non_exhaustive()
    }
}
