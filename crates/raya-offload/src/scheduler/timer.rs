//! Timer thread and `sleep`
//!
//! One timer thread per scheduler keeps a min-heap of deadlines and wakes
//! light-tasks whose deadline passed.

use super::worker::current_handle;
use crate::error::{OffloadError, OffloadResult};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Timer entry (min-heap by deadline, FIFO among equal deadlines)
///
/// The waker lives in `TimerState::wakers`; an entry whose seq is missing
/// there was cancelled and is skipped when it surfaces.
struct TimerEntry {
    deadline: Instant,
    seq: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse for min-heap
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,

    /// Live registrations by seq
    wakers: FxHashMap<u64, Waker>,
}

impl TimerState {
    /// Drop cancelled entries once they outnumber the live ones
    fn compact(&mut self) {
        if self.heap.len() > 2 * self.wakers.len() + 64 {
            let wakers = &self.wakers;
            self.heap.retain(|entry| wakers.contains_key(&entry.seq));
        }
    }
}

pub(crate) struct TimerQueue {
    state: Mutex<TimerState>,
    condvar: Condvar,
    next_seq: AtomicU64,
    stopped: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TimerState::default()),
            condvar: Condvar::new(),
            next_seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn start(self: &Arc<Self>, name: String) -> OffloadResult<()> {
        let queue = self.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || queue.run())
            .map_err(|e| OffloadError::ThreadSpawn(Arc::new(e)))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Wake `waker` once `deadline` has passed; returns the entry's seq
    pub(crate) fn register(&self, deadline: Instant, waker: Waker) -> u64 {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut state = self.state.lock();
        let earliest = state.heap.peek().map_or(true, |e| deadline < e.deadline);
        state.heap.push(TimerEntry { deadline, seq });
        state.wakers.insert(seq, waker);
        drop(state);

        if earliest {
            self.condvar.notify_one();
        }
        seq
    }

    /// Replace the waker of a live entry. False if it already fired.
    pub(crate) fn update(&self, seq: u64, waker: &Waker) -> bool {
        let mut state = self.state.lock();
        match state.wakers.get_mut(&seq) {
            Some(current) => {
                if !current.will_wake(waker) {
                    *current = waker.clone();
                }
                true
            }
            None => false,
        }
    }

    /// Forget an entry that has not fired yet
    pub(crate) fn cancel(&self, seq: u64) {
        let mut state = self.state.lock();
        if state.wakers.remove(&seq).is_some() {
            state.compact();
        }
    }

    /// Registrations that have neither fired nor been cancelled
    pub(crate) fn pending(&self) -> usize {
        self.state.lock().wakers.len()
    }

    fn run(&self) {
        tracing::debug!("timer thread started");
        let mut state = self.state.lock();
        loop {
            if self.stopped.load(AtomicOrdering::Acquire) {
                break;
            }

            let now = Instant::now();
            let mut expired = Vec::new();
            while state.heap.peek().is_some_and(|e| e.deadline <= now) {
                if let Some(entry) = state.heap.pop() {
                    if let Some(waker) = state.wakers.remove(&entry.seq) {
                        expired.push(waker);
                    }
                }
            }

            if !expired.is_empty() {
                drop(state);
                for waker in expired {
                    waker.wake();
                }
                state = self.state.lock();
                continue;
            }

            match state.heap.peek().map(|e| e.deadline) {
                Some(deadline) => {
                    self.condvar.wait_until(&mut state, deadline);
                }
                None => self.condvar.wait(&mut state),
            }
        }
        tracing::debug!("timer thread stopped");
    }

    /// Stop and join the timer thread; pending sleeps are never woken
    pub(crate) fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::Release);
        {
            let _state = self.state.lock();
            self.condvar.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("timer thread panicked");
            }
        }
        let dropped = std::mem::take(&mut *self.state.lock());
        drop(dropped);
    }
}

/// Sleep the current light-task for `duration`
///
/// The OS thread is not blocked; the task is woken by the scheduler's timer.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep::new(duration)
}

/// Future returned by `sleep`
///
/// # Panics
///
/// Polling a pending `Sleep` outside a scheduler worker thread panics: there
/// is no timer to wake it.
#[must_use = "a Sleep does nothing unless awaited"]
pub struct Sleep {
    deadline: Instant,

    /// Timer and seq of this sleep's registration, set on the first pending poll
    entry: Option<(Arc<TimerQueue>, u64)>,
}

impl Sleep {
    /// Sleep for `duration` starting now
    pub fn new(duration: Duration) -> Self {
        Self::until(Instant::now() + duration)
    }

    /// Sleep until `deadline`
    pub fn until(deadline: Instant) -> Self {
        Self {
            deadline,
            entry: None,
        }
    }

    /// When the sleep ends
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if Instant::now() >= this.deadline {
            if let Some((timer, seq)) = this.entry.take() {
                timer.cancel(seq);
            }
            return Poll::Ready(());
        }

        if let Some((timer, seq)) = &mut this.entry {
            if !timer.update(*seq, cx.waker()) {
                // Fired after the clock read above.
                *seq = timer.register(this.deadline, cx.waker().clone());
            }
            return Poll::Pending;
        }

        let timer = match current_handle() {
            Some(handle) => handle.timer().clone(),
            None => panic!("Sleep polled outside a raya-offload scheduler worker"),
        };
        let seq = timer.register(this.deadline, cx.waker().clone());
        this.entry = Some((timer, seq));
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((timer, seq)) = self.entry.take() {
            timer.cancel(seq);
        }
    }
}
