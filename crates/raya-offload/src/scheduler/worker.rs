//! Scheduler worker thread that polls light-tasks

use super::scheduler::{Handle, Shared};
use super::task::Task;
use crate::error::{OffloadError, OffloadResult};
use crossbeam_deque::{Steal, Stealer, Worker as CWorker};
use std::cell::RefCell;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Whether the current OS thread is a scheduler worker
///
/// Blocking calls must never run on such a thread.
pub fn is_worker_thread() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

pub(crate) fn current_handle() -> Option<Handle> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Worker thread that polls light-tasks
pub(crate) struct Worker {
    /// Worker ID
    id: usize,

    /// Worker thread handle
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread with its local run queue
    pub(crate) fn spawn(
        id: usize,
        local: CWorker<Arc<Task>>,
        scheduler: Handle,
        name: String,
        idle_park: Duration,
    ) -> OffloadResult<Self> {
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                CURRENT.with(|current| *current.borrow_mut() = Some(scheduler.clone()));
                Worker::run_loop(id, &local, scheduler.shared(), idle_park);
                CURRENT.with(|current| current.borrow_mut().take());
            })
            .map_err(|e| OffloadError::ThreadSpawn(Arc::new(e)))?;

        Ok(Self {
            id,
            handle: Some(handle),
        })
    }

    /// Wait for the worker thread to exit; the shutdown flag must be set
    pub(crate) fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                tracing::warn!(worker = self.id, "scheduler worker asked to join itself; detaching");
                return;
            }
            if handle.join().is_err() {
                tracing::warn!(worker = self.id, "scheduler worker panicked");
            }
        }
    }

    /// Worker thread main loop
    fn run_loop(id: usize, local: &CWorker<Arc<Task>>, shared: &Shared, idle_park: Duration) {
        tracing::debug!(worker = id, "scheduler worker started");

        loop {
            if shared.is_shutting_down() {
                break;
            }

            let task = match Self::find_work(local, shared) {
                Some(task) => task,
                None => {
                    shared.park_idle(idle_park);
                    continue;
                }
            };

            Self::run_task(local, shared, task);
        }

        tracing::debug!(worker = id, "scheduler worker stopped");
    }

    fn run_task(local: &CWorker<Arc<Task>>, shared: &Shared, task: Arc<Task>) {
        if !task.begin_run() {
            return;
        }
        shared.record_poll();

        if task.poll_future() {
            task.complete();
            shared.finish(task.id());
        } else if task.end_run_pending() {
            // Woken during its own poll.
            local.push(task);
        }
    }

    /// Find work: local pop, then the global injector, then steal
    fn find_work(local: &CWorker<Arc<Task>>, shared: &Shared) -> Option<Arc<Task>> {
        // 1. Local queue
        if let Some(task) = local.pop() {
            return Some(task);
        }

        // 2. Global injector (resumed and newly spawned tasks land here)
        loop {
            match shared.injector().steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // 3. Other workers
        Self::steal_from_others(shared.stealers())
    }

    /// Steal from other workers
    fn steal_from_others(stealers: &[Stealer<Arc<Task>>]) -> Option<Arc<Task>> {
        use rand::Rng;

        if stealers.is_empty() {
            return None;
        }

        // Randomly select a victim
        let mut rng = rand::thread_rng();
        let start = rng.gen_range(0..stealers.len());

        // Try each stealer starting from random position
        for i in 0..stealers.len() {
            let index = (start + i) % stealers.len();
            let stealer = &stealers[index];

            loop {
                match stealer.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_thread_is_not_worker() {
        assert!(!is_worker_thread());
        assert!(current_handle().is_none());
    }

    #[test]
    fn test_steal_from_empty_stealers() {
        assert!(Worker::steal_from_others(&[]).is_none());

        let deque: CWorker<Arc<Task>> = CWorker::new_fifo();
        assert!(Worker::steal_from_others(&[deque.stealer()]).is_none());
    }
}
