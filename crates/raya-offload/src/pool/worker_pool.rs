//! Fixed-size pool of OS threads for blocking work

use super::item::{WorkId, WorkItem, WorkOutcome};
use super::queue::WorkQueue;
use crate::config::{PoolConfig, QueuePolicy, ShutdownPolicy};
use crate::error::{OffloadError, OffloadResult};
use crate::scheduler::is_worker_thread;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Worker pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Items accepted by `enqueue`
    pub submitted: u64,

    /// Items that ran to completion
    pub completed: u64,

    /// Items that returned an error or panicked
    pub failed: u64,

    /// Items dropped unrun by a cancelling shutdown
    pub cancelled: u64,

    /// Items waiting in the queue
    pub queued: usize,

    /// Number of pool threads
    pub threads: usize,
}

/// State shared with every pool thread
struct PoolShared {
    /// Shared FIFO consumed by all pool threads
    work_rx: Receiver<WorkItem>,

    /// Set by a cancelling shutdown; queued items are dropped unrun
    cancel: AtomicBool,

    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl PoolShared {
    fn discard(&self, item: WorkItem) {
        tracing::trace!(work = %item.id(), "dropping queued work unrun");
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        drop(item);
    }
}

/// Pool of OS threads that run blocking work to completion
///
/// Threads are isolated from the light-task scheduler: nothing queued here
/// ever runs on a scheduler worker thread.
pub struct WorkerPool {
    /// Channel: submitters → pool threads (None once shut down)
    work_tx: RwLock<Option<Sender<WorkItem>>>,

    shared: Arc<PoolShared>,

    /// Thread handles
    handles: Mutex<Vec<JoinHandle<()>>>,

    config: PoolConfig,
}

impl WorkerPool {
    /// Start the pool threads
    pub fn new(config: PoolConfig) -> OffloadResult<Self> {
        let (work_tx, work_rx) = match config.queue {
            QueuePolicy::Unbounded => channel::unbounded::<WorkItem>(),
            QueuePolicy::Bounded { capacity } => channel::bounded::<WorkItem>(capacity.max(1)),
        };

        let shared = Arc::new(PoolShared {
            work_rx,
            cancel: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        });

        let pool = Self {
            work_tx: RwLock::new(Some(work_tx)),
            shared,
            handles: Mutex::new(Vec::new()),
            config,
        };

        let count = pool.config.resolved_threads();
        for i in 0..count {
            let shared = pool.shared.clone();

            let name = format!("{}-{}", pool.config.thread_name, i);
            let mut builder = thread::Builder::new().name(name);
            if let Some(stack_size) = pool.config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            // On failure `pool` is dropped, which joins the threads started so far.
            let handle = builder
                .spawn(move || Self::io_worker_loop(i, shared))
                .map_err(|e| OffloadError::ThreadSpawn(Arc::new(e)))?;
            pool.handles.lock().push(handle);
        }

        tracing::debug!(threads = count, queue = ?pool.config.queue, "worker pool started");
        Ok(pool)
    }

    /// Queue `item`; see `WorkQueue::enqueue`
    ///
    /// With a bounded queue a full enqueue blocks a plain OS thread until
    /// space frees up, but fails with `QueueFull` on a scheduler worker
    /// thread.
    pub fn enqueue(&self, item: WorkItem) -> OffloadResult<WorkId> {
        let work_tx = self
            .work_tx
            .read()
            .as_ref()
            .cloned()
            .ok_or(OffloadError::PoolShutdown)?;
        let id = item.id();

        match work_tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                let capacity = work_tx.capacity().unwrap_or(0);
                if is_worker_thread() {
                    tracing::debug!(work = %id, capacity, "worker pool queue full");
                    drop(item);
                    return Err(OffloadError::QueueFull { capacity });
                }
                work_tx
                    .send(item)
                    .map_err(|_| OffloadError::PoolShutdown)?;
            }
            Err(TrySendError::Disconnected(_)) => return Err(OffloadError::PoolShutdown),
        }

        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(work = %id, "work queued");
        Ok(id)
    }

    /// Stop accepting work, settle the queue per `policy`, join the threads
    ///
    /// Idempotent: only the first call does anything. Items already running
    /// are never interrupted.
    pub fn shutdown(&self, policy: ShutdownPolicy) {
        let Some(work_tx) = self.work_tx.write().take() else {
            return;
        };

        if policy == ShutdownPolicy::Cancel {
            self.shared.cancel.store(true, Ordering::Release);
        }

        // Dropping the last sender ends every thread's receive loop once the
        // queue is empty.
        drop(work_tx);

        if policy == ShutdownPolicy::Cancel {
            for item in self.shared.work_rx.try_iter() {
                self.shared.discard(item);
            }
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        let timeout = self.config.join_timeout();
        for handle in handles {
            match timeout {
                Some(timeout) => Self::join_with_timeout(handle, timeout),
                None => {
                    if handle.join().is_err() {
                        tracing::warn!("io worker thread panicked");
                    }
                }
            }
        }

        tracing::debug!(?policy, stats = ?self.stats(), "worker pool shut down");
    }

    /// Whether `shutdown` has run
    pub fn is_shut_down(&self) -> bool {
        self.work_tx.read().is_none()
    }

    /// Number of pool threads
    pub fn thread_count(&self) -> usize {
        self.config.resolved_threads()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            submitted: shared.submitted.load(Ordering::Relaxed),
            completed: shared.completed.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            cancelled: shared.cancelled.load(Ordering::Relaxed),
            queued: shared.work_rx.len(),
            threads: self.thread_count(),
        }
    }

    /// Join a thread with timeout, detach if stuck.
    fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
        let start = Instant::now();
        loop {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::warn!("io worker thread panicked");
                }
                return;
            }
            if start.elapsed() > timeout {
                let name = handle.thread().name().unwrap_or("io-worker").to_string();
                tracing::warn!(thread = %name, ?timeout, "io worker did not stop in time; detaching");
                drop(handle);
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    // ========================================================================
    // IO Worker Loop
    // ========================================================================

    fn io_worker_loop(index: usize, shared: Arc<PoolShared>) {
        tracing::debug!(worker = index, "io worker started");

        for item in shared.work_rx.iter() {
            if shared.cancel.load(Ordering::Acquire) {
                shared.discard(item);
                continue;
            }

            let id = item.id();
            match item.run() {
                WorkOutcome::Completed => {
                    shared.completed.fetch_add(1, Ordering::Relaxed);
                }
                WorkOutcome::Failed(error) => {
                    shared.failed.fetch_add(1, Ordering::Relaxed);
                    if error.is_panic() {
                        tracing::error!(work = %id, error = %error, "offloaded work panicked");
                    } else {
                        tracing::debug!(work = %id, error = %error, "offloaded work failed");
                    }
                }
            }
        }

        tracing::debug!(worker = index, "io worker stopped");
    }
}

impl WorkQueue for WorkerPool {
    fn enqueue(&self, item: WorkItem) -> OffloadResult<WorkId> {
        WorkerPool::enqueue(self, item)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(self.config.shutdown);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.thread_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
