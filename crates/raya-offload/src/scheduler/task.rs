//! Light-task structure and run state

use super::scheduler::Shared;
use crate::error::{OffloadError, OffloadResult};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Unique identifier for a light-task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a TaskId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        TaskId(id)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a light-task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Spawned and queued, never run
    Created = 0,
    /// Being polled by a worker
    Running = 1,
    /// Woken while running; the worker requeues it after the poll
    Notified = 2,
    /// Waiting for a wake; not in any queue
    Suspended = 3,
    /// Woken and queued again
    Resumed = 4,
    /// Finished (or dropped at shutdown)
    Completed = 5,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Running,
            2 => TaskState::Notified,
            3 => TaskState::Suspended,
            4 => TaskState::Resumed,
            _ => TaskState::Completed,
        }
    }
}

/// A light-task: a boxed future plus its run state
///
/// A task sits in at most one run queue at a time and is polled by at most
/// one worker at a time; the state word arbitrates between wakes and polls.
pub(crate) struct Task {
    id: TaskId,
    state: AtomicU8,
    future: Mutex<Option<BoxFuture>>,
    waker: Waker,
    scheduler: Weak<Shared>,
}

impl Task {
    pub(crate) fn new(future: BoxFuture, scheduler: Weak<Shared>) -> Arc<Self> {
        Arc::new_cyclic(|task| Self {
            id: TaskId::new(),
            state: AtomicU8::new(TaskState::Created as u8),
            future: Mutex::new(Some(future)),
            waker: Waker::from(Arc::new(TaskWaker { task: task.clone() })),
            scheduler,
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn cas(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Created/Resumed -> Running. False if the task is not runnable.
    pub(crate) fn begin_run(&self) -> bool {
        self.cas(TaskState::Created, TaskState::Running)
            || self.cas(TaskState::Resumed, TaskState::Running)
    }

    /// Settle the state after a `Pending` poll.
    ///
    /// Returns true when a wake arrived during the poll and the task must be
    /// queued again.
    pub(crate) fn end_run_pending(&self) -> bool {
        if self.cas(TaskState::Running, TaskState::Suspended) {
            return false;
        }
        // Only a wake can move a running task, and it always lands on Notified.
        self.state
            .store(TaskState::Resumed as u8, Ordering::Release);
        true
    }

    pub(crate) fn complete(&self) {
        self.state
            .store(TaskState::Completed as u8, Ordering::Release);
    }

    /// Record a wake. Returns true when the caller must enqueue the task.
    fn transition_to_resumed(&self) -> bool {
        loop {
            match self.state() {
                TaskState::Suspended => {
                    if self.cas(TaskState::Suspended, TaskState::Resumed) {
                        return true;
                    }
                }
                TaskState::Running => {
                    if self.cas(TaskState::Running, TaskState::Notified) {
                        return false;
                    }
                }
                // Already queued, already marked, or finished.
                TaskState::Created
                | TaskState::Notified
                | TaskState::Resumed
                | TaskState::Completed => return false,
            }
        }
    }

    /// Poll the future once. Returns true when the task is finished.
    pub(crate) fn poll_future(&self) -> bool {
        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return true;
        };

        let mut cx = Context::from_waker(&self.waker);
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => false,
            Ok(Poll::Ready(())) => {
                *slot = None;
                true
            }
            Err(_) => {
                tracing::error!(task = self.id.as_u64(), "light-task panicked while being polled");
                *slot = None;
                true
            }
        }
    }

    /// Drop the future without running it to completion
    pub(crate) fn cancel(&self) {
        let future = self.future.lock().take();
        self.complete();
        drop(future);
    }

    /// Put the task back on its scheduler's run queue
    fn schedule(self: &Arc<Self>) -> OffloadResult<()> {
        let shared = self.scheduler.upgrade().ok_or(OffloadError::SchedulerShutdown)?;
        shared.resume(self.clone())
    }
}

/// Resume hook handed to the bridge as a `Waker`
///
/// Holds only a weak reference: a pending continuation never keeps a
/// light-task alive.
struct TaskWaker {
    task: Weak<Task>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let Some(task) = self.task.upgrade() else {
            tracing::debug!("resume dropped: light-task no longer exists");
            return;
        };
        if task.transition_to_resumed() {
            if let Err(e) = task.schedule() {
                tracing::warn!(
                    task = task.id().as_u64(),
                    error = %e,
                    "could not resume light-task; result dropped"
                );
            }
        }
    }
}

/// Future that catches a panic in the wrapped future
pub(crate) struct CatchUnwind<F> {
    future: Pin<Box<F>>,
}

impl<F: Future> CatchUnwind<F> {
    pub(crate) fn new(future: F) -> Self {
        Self {
            future: Box::pin(future),
        }
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn std::any::Any + Send>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let future = &mut self.get_mut().future;
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

/// Yield the current light-task once, letting other ready tasks run
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by `yield_now`
#[must_use = "yield_now does nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
