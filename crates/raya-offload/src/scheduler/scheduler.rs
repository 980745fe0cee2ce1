//! Cooperative scheduler coordinating worker threads

use super::task::{BoxFuture, CatchUnwind, Task, TaskId, TaskState};
use super::timer::TimerQueue;
use super::worker::{current_handle, is_worker_thread, Worker};
use crate::bridge::{promise, PromiseFuture};
use crate::config::SchedulerConfig;
use crate::error::{OffloadError, OffloadResult, WorkError};
use crossbeam_deque::{Injector, Stealer, Worker as CWorker};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Handle to a spawned light-task's result
///
/// Resolves to `Cancelled` if the scheduler shuts down before the task
/// finishes, and to `WorkFailed` if the task panicked.
pub type JoinHandle<T> = PromiseFuture<T>;

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Total tasks spawned
    pub tasks_spawned: u64,

    /// Total tasks completed
    pub tasks_completed: u64,

    /// Tasks spawned but not finished (queued, running or suspended)
    pub active_tasks: usize,

    /// Total polls across all tasks
    pub polls: u64,

    /// Suspended tasks made runnable again by a wake
    pub resumes: u64,

    /// Sleeps waiting on the timer thread
    pub pending_timers: usize,

    /// Number of worker threads
    pub workers: usize,
}

/// State shared by the scheduler, its workers and every task waker
pub(crate) struct Shared {
    /// Global queue for spawned and resumed tasks
    injector: Injector<Arc<Task>>,

    /// Stealers for every worker's local deque
    stealers: Vec<Stealer<Arc<Task>>>,

    /// Unfinished tasks; keeps suspended tasks alive
    tasks: RwLock<FxHashMap<TaskId, Arc<Task>>>,

    timer: Arc<TimerQueue>,

    /// Number of parked workers
    idle: Mutex<usize>,
    idle_cv: Condvar,

    shutdown: AtomicBool,
    started: AtomicBool,

    tasks_spawned: AtomicU64,
    tasks_completed: AtomicU64,
    polls: AtomicU64,
    resumes: AtomicU64,
}

impl Shared {
    pub(crate) fn injector(&self) -> &Injector<Arc<Task>> {
        &self.injector
    }

    pub(crate) fn stealers(&self) -> &[Stealer<Arc<Task>>] {
        &self.stealers
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Queue a woken task again
    pub(crate) fn resume(&self, task: Arc<Task>) -> OffloadResult<()> {
        if self.is_shutting_down() {
            return Err(OffloadError::SchedulerShutdown);
        }
        self.resumes.fetch_add(1, Ordering::Relaxed);
        self.push(task);
        Ok(())
    }

    fn spawn(self: &Arc<Self>, future: BoxFuture) -> OffloadResult<TaskId> {
        let task = Task::new(future, Arc::downgrade(self));
        let task_id = task.id();

        // Register task. The flag is checked under the registry lock so that
        // `cancel_all` either sees this task or this spawn sees the flag.
        {
            let mut tasks = self.tasks.write();
            if self.is_shutting_down() {
                return Err(OffloadError::SchedulerShutdown);
            }
            tasks.insert(task_id, task.clone());
        }
        self.tasks_spawned.fetch_add(1, Ordering::Relaxed);

        // Push to global injector
        self.push(task);

        Ok(task_id)
    }

    fn push(&self, task: Arc<Task>) {
        self.injector.push(task);
        self.notify_one();
    }

    fn notify_one(&self) {
        if *self.idle.lock() > 0 {
            self.idle_cv.notify_one();
        }
    }

    fn notify_all(&self) {
        let _idle = self.idle.lock();
        self.idle_cv.notify_all();
    }

    /// Park an idle worker until new work arrives or `timeout` passes
    pub(crate) fn park_idle(&self, timeout: Duration) {
        let mut idle = self.idle.lock();
        if !self.injector.is_empty() || self.is_shutting_down() {
            return;
        }
        *idle += 1;
        self.idle_cv.wait_for(&mut idle, timeout);
        *idle -= 1;
    }

    pub(crate) fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a completed task from the registry
    pub(crate) fn finish(&self, task_id: TaskId) {
        if self.tasks.write().remove(&task_id).is_some() {
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stats(&self, workers: usize) -> SchedulerStats {
        let active_tasks = self
            .tasks
            .read()
            .values()
            .filter(|task| task.state() != TaskState::Completed)
            .count();

        SchedulerStats {
            tasks_spawned: self.tasks_spawned.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            active_tasks,
            polls: self.polls.load(Ordering::Relaxed),
            resumes: self.resumes.load(Ordering::Relaxed),
            pending_timers: self.timer.pending(),
            workers,
        }
    }

    /// Drop every unfinished task; their join handles resolve to `Cancelled`
    ///
    /// The shutdown flag must already be set.
    fn cancel_all(&self) -> usize {
        while !self.injector.steal().is_empty() {}

        let tasks: Vec<Arc<Task>> = self.tasks.write().drain().map(|(_, task)| task).collect();
        let count = tasks.len();
        for task in tasks {
            task.cancel();
        }
        count
    }
}

/// Cheap, cloneable reference to a running scheduler
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
    workers: usize,
}

impl Handle {
    /// Handle of the scheduler running the current worker thread
    ///
    /// # Panics
    ///
    /// Panics when called off a scheduler worker thread; use `try_current`
    /// to check first.
    pub fn current() -> Self {
        match current_handle() {
            Some(handle) => handle,
            None => panic!("Handle::current() called outside a raya-offload scheduler worker"),
        }
    }

    /// Handle of the scheduler running the current worker thread, if any
    pub fn try_current() -> Option<Self> {
        current_handle()
    }

    /// Spawn a light-task
    ///
    /// Tasks spawned before `Scheduler::start` wait in the queue until the
    /// workers come up.
    pub fn spawn<F>(&self, future: F) -> OffloadResult<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (promise, join) = promise();
        let task = async move {
            match CatchUnwind::new(future).await {
                Ok(value) => promise.resolve(value),
                Err(payload) => {
                    let error = WorkError::from_panic(payload);
                    tracing::error!(error = %error, "light-task panicked");
                    promise.reject(OffloadError::WorkFailed(error));
                }
            }
        };
        self.shared.spawn(Box::pin(task))?;
        Ok(join)
    }

    /// Run `future` as a light-task and block this OS thread until it ends
    ///
    /// Fails with `WouldBlockScheduler` on a scheduler worker thread.
    pub fn block_on<F>(&self, future: F) -> OffloadResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if is_worker_thread() {
            return Err(OffloadError::WouldBlockScheduler);
        }
        if !self.shared.started.load(Ordering::Acquire) {
            return Err(OffloadError::SchedulerShutdown);
        }
        self.spawn(future)?.wait()
    }

    /// Scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats(self.workers)
    }

    /// Whether `shutdown` has begun
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn timer(&self) -> &Arc<TimerQueue> {
        &self.shared.timer
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("workers", &self.workers)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Cooperative multi-threaded light-task scheduler
///
/// Light-tasks are futures polled by a fixed set of worker threads. A task
/// runs until it returns `Pending`; it is queued again only when its waker
/// fires.
pub struct Scheduler {
    handle: Handle,

    /// Worker threads
    workers: Mutex<Vec<Worker>>,

    /// Local deques handed to the workers at start
    locals: Mutex<Vec<CWorker<Arc<Task>>>>,

    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a new scheduler with the specified number of workers
    /// If worker_count is 0, defaults to the number of CPU cores
    pub fn new(worker_count: usize) -> Self {
        Self::with_config(SchedulerConfig::with_workers(worker_count))
    }

    /// Create a scheduler from a config; workers start with `start`
    pub fn with_config(config: SchedulerConfig) -> Self {
        let count = config.resolved_workers();
        let locals: Vec<CWorker<Arc<Task>>> = (0..count).map(|_| CWorker::new_fifo()).collect();
        let stealers = locals.iter().map(|local| local.stealer()).collect();

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            tasks: RwLock::new(FxHashMap::default()),
            timer: Arc::new(TimerQueue::new()),
            idle: Mutex::new(0),
            idle_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            started: AtomicBool::new(false),
            tasks_spawned: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            resumes: AtomicU64::new(0),
        });

        Self {
            handle: Handle {
                shared,
                workers: count,
            },
            workers: Mutex::new(Vec::with_capacity(count)),
            locals: Mutex::new(locals),
            config,
        }
    }

    /// Start the timer thread and all worker threads
    ///
    /// Calling it again is a no-op; calling it after `shutdown` fails.
    pub fn start(&self) -> OffloadResult<()> {
        let shared = &self.handle.shared;
        if shared.is_shutting_down() {
            return Err(OffloadError::SchedulerShutdown);
        }

        let mut locals = self.locals.lock();
        if locals.is_empty() {
            return Ok(());
        }

        shared
            .timer
            .start(format!("{}-timer", self.config.thread_name))?;

        let mut workers = self.workers.lock();
        for (id, local) in locals.drain(..).enumerate() {
            let worker = Worker::spawn(
                id,
                local,
                self.handle.clone(),
                format!("{}-{}", self.config.thread_name, id),
                self.config.idle_park(),
            )?;
            workers.push(worker);
        }

        shared.started.store(true, Ordering::Release);
        tracing::debug!(workers = workers.len(), "scheduler started");
        Ok(())
    }

    /// Handle for spawning from anywhere
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a light-task; see `Handle::spawn`
    pub fn spawn<F>(&self, future: F) -> OffloadResult<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run a light-task to completion from a plain OS thread; see `Handle::block_on`
    pub fn block_on<F>(&self, future: F) -> OffloadResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.block_on(future)
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.handle.workers
    }

    /// Check if the scheduler has been started
    pub fn is_started(&self) -> bool {
        self.handle.shared.started.load(Ordering::Acquire)
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.handle.stats()
    }

    /// Stop all workers and drop unfinished light-tasks
    ///
    /// Idempotent. Called from one of this scheduler's own light-tasks, the
    /// workers are joined and the tasks dropped on a separate teardown
    /// thread once the current poll returns.
    pub fn shutdown(&self) {
        let shared = &self.handle.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        shared.notify_all();
        let workers: Vec<Worker> = self.workers.lock().drain(..).collect();

        if is_worker_thread() {
            tracing::warn!("scheduler shut down from a worker thread; finishing in the background");
            let teardown = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-teardown", self.config.thread_name))
                .spawn(move || Self::teardown(&teardown, workers));
            if let Err(e) = spawned {
                tracing::error!(error = %e, "failed to spawn scheduler teardown thread");
            }
            return;
        }

        Self::teardown(shared, workers);
    }

    fn teardown(shared: &Shared, workers: Vec<Worker>) {
        // Stop all workers
        for mut worker in workers {
            worker.stop();
        }

        shared.timer.stop();

        let cancelled = shared.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "scheduler shut down with unfinished light-tasks");
        } else {
            tracing::debug!("scheduler shut down");
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_config(SchedulerConfig::default())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{sleep, yield_now};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn started(workers: usize) -> Scheduler {
        let scheduler = Scheduler::new(workers);
        scheduler.start().unwrap();
        scheduler
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(0);
        assert!(scheduler.worker_count() > 0);
        assert!(!scheduler.is_started());
    }

    #[test]
    fn test_spawn_and_join() {
        let scheduler = started(2);
        let join = scheduler.spawn(async { 40 + 2 }).unwrap();
        assert_eq!(join.wait().unwrap(), 42);

        // The join handle resolves just before the worker retires the task.
        let start = Instant::now();
        while scheduler.stats().tasks_completed < 1 {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(1));
        }
        let stats = scheduler.stats();
        assert_eq!(stats.tasks_spawned, 1);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.workers, 2);
    }

    #[test]
    fn test_block_on() {
        let scheduler = started(1);
        let value = scheduler
            .block_on(async {
                yield_now().await;
                "done"
            })
            .unwrap();
        assert_eq!(value, "done");
    }

    #[test]
    fn test_block_on_before_start_fails() {
        let scheduler = Scheduler::new(1);
        assert!(matches!(
            scheduler.block_on(async {}),
            Err(OffloadError::SchedulerShutdown)
        ));
    }

    #[test]
    fn test_spawn_before_start_runs_after_start() {
        let scheduler = Scheduler::new(1);
        let join = scheduler.spawn(async { 7 }).unwrap();
        scheduler.start().unwrap();
        assert_eq!(join.wait().unwrap(), 7);
    }

    #[test]
    fn test_many_tasks() {
        let scheduler = started(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let joins: Vec<_> = (0..200)
            .map(|_| {
                let counter = counter.clone();
                scheduler
                    .spawn(async move {
                        yield_now().await;
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap()
            })
            .collect();

        for join in joins {
            join.wait().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_panicking_task_reports_failure() {
        let scheduler = started(1);
        let join = scheduler
            .spawn(async {
                panic!("light-task exploded");
            })
            .unwrap();
        let err = join.wait().unwrap_err();
        let work = err.work_error().unwrap();
        assert!(work.is_panic());
        assert!(work.message().contains("light-task exploded"));

        // The worker survived.
        assert_eq!(scheduler.block_on(async { 1 }).unwrap(), 1);
    }

    #[test]
    fn test_handle_current_inside_task() {
        let scheduler = started(1);
        assert!(Handle::try_current().is_none());

        let inside = scheduler
            .block_on(async { (is_worker_thread(), Handle::try_current().is_some()) })
            .unwrap();
        assert_eq!(inside, (true, true));
    }

    #[test]
    fn test_sleep_does_not_block_worker() {
        let scheduler = started(1);
        let start = Instant::now();

        let sleeper = scheduler
            .spawn(async {
                sleep(Duration::from_millis(100)).await;
            })
            .unwrap();
        // Runs on the only worker while the sleeper is suspended.
        let quick = scheduler.spawn(async { Instant::now() }).unwrap();

        let quick_done = quick.wait().unwrap();
        sleeper.wait().unwrap();
        assert!(quick_done.duration_since(start) < Duration::from_millis(100));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_wait_inside_task_refuses_to_block() {
        let scheduler = started(1);
        let result = scheduler
            .block_on(async {
                let (_promise, future) = promise::<i32>();
                future.wait()
            })
            .unwrap();
        assert!(matches!(result, Err(OffloadError::WouldBlockScheduler)));
    }

    #[test]
    fn test_shutdown_cancels_suspended_tasks() {
        let scheduler = started(1);
        let (promise, future) = promise::<i32>();
        let join = scheduler.spawn(async move { future.await }).unwrap();

        // Let the task reach its await.
        while scheduler.stats().polls == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        scheduler.shutdown();
        assert!(matches!(join.wait(), Err(OffloadError::Cancelled)));
        assert!(promise.is_abandoned());

        // Idempotent, and later spawns are rejected.
        scheduler.shutdown();
        assert!(matches!(
            scheduler.spawn(async {}),
            Err(OffloadError::SchedulerShutdown)
        ));
        assert!(matches!(scheduler.start(), Err(OffloadError::SchedulerShutdown)));
    }

    #[test]
    fn test_spawn_racing_shutdown_never_hangs() {
        for _ in 0..100 {
            let scheduler = started(2);
            let handle = scheduler.handle().clone();

            let spawner = std::thread::spawn(move || {
                (0..200)
                    .filter_map(|i| handle.spawn(async move { i }).ok())
                    .collect::<Vec<_>>()
            });
            scheduler.shutdown();

            for join in spawner.join().unwrap() {
                match join.wait_timeout(Duration::from_secs(5)) {
                    Ok(_) | Err(OffloadError::Cancelled) => {}
                    Err(e) => panic!("join handle did not settle: {e}"),
                }
            }
        }
    }

    #[test]
    fn test_drop_scheduler_inside_own_task() {
        let scheduler = started(1);
        let handle = scheduler.handle().clone();

        let join = handle
            .spawn(async move {
                drop(scheduler);
                is_worker_thread()
            })
            .unwrap();
        assert!(join.wait().unwrap());
        assert!(handle.is_shut_down());

        let start = Instant::now();
        while handle.stats().active_tasks > 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            handle.spawn(async {}),
            Err(OffloadError::SchedulerShutdown)
        ));
    }
}
