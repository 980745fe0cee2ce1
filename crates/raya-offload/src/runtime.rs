//! Runtime: one scheduler, one IO pool and an executor bound to it

use crate::config::{RuntimeConfig, ShutdownPolicy};
use crate::error::OffloadResult;
use crate::executor::OffloadExecutor;
use crate::pool::{PoolStats, WorkerPool};
use crate::scheduler::{Handle, JoinHandle, Scheduler, SchedulerStats};
use std::future::Future;
use std::sync::Arc;

/// Owns a light-task scheduler and an IO worker pool
///
/// Nothing is global: every runtime is built and torn down explicitly, and
/// several runtimes can coexist in one process.
pub struct Runtime {
    scheduler: Scheduler,
    pool: Arc<WorkerPool>,
    executor: OffloadExecutor,
    config: RuntimeConfig,
}

impl Runtime {
    /// Build and start the pool and the scheduler
    pub fn new(config: RuntimeConfig) -> OffloadResult<Self> {
        let pool = Arc::new(WorkerPool::new(config.io_pool.clone())?);
        let executor = OffloadExecutor::from_pool(pool.clone());

        let scheduler = Scheduler::with_config(config.scheduler.clone());
        scheduler.start()?;

        tracing::info!(
            workers = scheduler.worker_count(),
            io_threads = pool.thread_count(),
            "runtime started"
        );

        Ok(Self {
            scheduler,
            pool,
            executor,
            config,
        })
    }

    /// Executor bound to this runtime's IO pool
    pub fn executor(&self) -> OffloadExecutor {
        self.executor.clone()
    }

    /// Handle to this runtime's scheduler
    pub fn handle(&self) -> Handle {
        self.scheduler.handle().clone()
    }

    /// Spawn a light-task
    pub fn spawn<F>(&self, future: F) -> OffloadResult<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.scheduler.spawn(future)
    }

    /// Run a light-task to completion from a plain OS thread
    pub fn block_on<F>(&self, future: F) -> OffloadResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.scheduler.block_on(future)
    }

    /// Configuration the runtime was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// IO pool statistics
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Scheduler statistics
    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Shut down the pool with `policy`, then the scheduler
    ///
    /// The scheduler stops right after the pool threads are joined, without
    /// waiting for resumed light-tasks to run again. Any light-task not
    /// finished by then is dropped and its join handle resolves to
    /// `Cancelled`; awaiting the work before shutting down is the way to
    /// observe its result. Idempotent, and safe to call from a light-task.
    pub fn shutdown(&self, policy: ShutdownPolicy) {
        self.pool.shutdown(policy);
        self.scheduler.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown(self.config.io_pool.shutdown);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", self.scheduler.handle())
            .field("pool", &self.pool)
            .finish()
    }
}
