//! Single-assignment promise and its read-once future
//!
//! Both halves share one slot. The slot's state word carries three bits:
//!
//! - `CONTINUATION`: the waiter stored a continuation
//! - `COMPLETE`: the promise stored the result
//! - `CLOSED`: the future was dropped unread
//!
//! Fulfilment and registration each publish their half with one `fetch_or`
//! and look at the bits that were already set. Whichever side arrives second
//! sees the other's bit and is responsible for resuming the waiter, so a
//! continuation fires exactly once and is never lost.

use super::Continuation;
use crate::error::{OffloadError, OffloadResult};
use crate::scheduler::{is_worker_thread, Sleep};
use crossbeam::sync::Parker;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

const CONTINUATION: u8 = 0b001;
const COMPLETE: u8 = 0b010;
const CLOSED: u8 = 0b100;

/// Observable state of a `PromiseFuture`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    /// Not fulfilled yet
    Pending,
    /// Fulfilled with a value
    Ready,
    /// Fulfilled with an error
    Failed,
    /// Fulfilled and the result was already read
    Taken,
}

struct Slot<T> {
    state: AtomicU8,
    value: Mutex<Option<OffloadResult<T>>>,
    continuation: Mutex<Option<Continuation>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            value: Mutex::new(None),
            continuation: Mutex::new(None),
        }
    }

    fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) & COMPLETE != 0
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSED != 0
    }

    fn complete(&self, result: OffloadResult<T>) -> OffloadResult<()> {
        let prev = {
            let mut value = self.value.lock();
            if self.state.load(Ordering::Acquire) & COMPLETE != 0 {
                return Err(OffloadError::AlreadyFulfilled);
            }
            *value = Some(result);
            self.state.fetch_or(COMPLETE, Ordering::AcqRel)
        };

        if prev & CLOSED != 0 {
            tracing::debug!("offload result has no observer; future was dropped");
        }

        if prev & CONTINUATION != 0 {
            let continuation = self.continuation.lock().take();
            if let Some(continuation) = continuation {
                continuation.resume();
            }
        }
        Ok(())
    }

    /// Store `continuation` to be fired by `complete`.
    ///
    /// Hands the continuation back if the slot is already complete; the
    /// caller must then resume on its own.
    fn register(&self, continuation: Continuation) -> Result<(), Continuation> {
        // Retract any earlier continuation before replacing it.
        let prev = self.state.fetch_and(!CONTINUATION, Ordering::AcqRel);
        if prev & COMPLETE != 0 {
            return Err(continuation);
        }

        *self.continuation.lock() = Some(continuation);

        let prev = self.state.fetch_or(CONTINUATION, Ordering::AcqRel);
        if prev & COMPLETE != 0 {
            // Completion ran between the two RMWs and did not see us.
            let continuation = self.continuation.lock().take();
            if let Some(continuation) = continuation {
                return Err(continuation);
            }
        }
        Ok(())
    }

    fn take(&self) -> Option<OffloadResult<T>> {
        if !self.is_complete() {
            return None;
        }
        self.value.lock().take()
    }

    fn status(&self) -> FutureStatus {
        if !self.is_complete() {
            return FutureStatus::Pending;
        }
        match &*self.value.lock() {
            Some(Ok(_)) => FutureStatus::Ready,
            Some(Err(_)) => FutureStatus::Failed,
            None => FutureStatus::Taken,
        }
    }

    fn close(&self) {
        self.state.fetch_or(CLOSED, Ordering::AcqRel);
        let stale = self.continuation.lock().take();
        drop(stale);
    }
}

/// Create a connected promise/future pair
pub fn promise<T>() -> (Promise<T>, PromiseFuture<T>) {
    let slot = Arc::new(Slot::new());
    (
        Promise {
            slot: Some(slot.clone()),
        },
        PromiseFuture { slot, done: false },
    )
}

/// Producer half: fulfilled exactly once
///
/// Dropping an unfulfilled promise fulfils it with `OffloadError::Cancelled`,
/// so its future never waits forever.
pub struct Promise<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Promise<T> {
    /// Fulfil with a value or an error and resume the waiter, if any
    ///
    /// # Panics
    ///
    /// Panics if the slot was already fulfilled. That can only happen through
    /// a bug in this crate and means the exactly-once invariant is broken.
    pub fn fulfill(mut self, result: OffloadResult<T>) {
        if let Some(slot) = self.slot.take() {
            if let Err(e) = slot.complete(result) {
                panic!("{e}: offload promise fulfilled twice");
            }
        }
    }

    /// Fulfil with a value
    pub fn resolve(self, value: T) {
        self.fulfill(Ok(value));
    }

    /// Fulfil with an error
    pub fn reject(self, error: OffloadError) {
        self.fulfill(Err(error));
    }

    /// Whether the future was dropped without reading the result
    pub fn is_abandoned(&self) -> bool {
        self.slot.as_ref().is_some_and(|slot| slot.is_closed())
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            // A second completion is impossible here: the slot was still ours.
            let _ = slot.complete(Err(OffloadError::Cancelled));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

/// Consumer half: read-once handle to the eventual result
///
/// Await it inside a light-task, `wait` on it from a plain OS thread, or
/// hand it a callback with `on_ready`.
#[must_use = "a PromiseFuture does nothing unless awaited or waited on"]
pub struct PromiseFuture<T> {
    slot: Arc<Slot<T>>,
    done: bool,
}

impl<T> PromiseFuture<T> {
    /// Current state; no side effects
    pub fn status(&self) -> FutureStatus {
        if self.done {
            FutureStatus::Taken
        } else {
            self.slot.status()
        }
    }

    /// Whether the promise was fulfilled
    pub fn is_ready(&self) -> bool {
        self.slot.is_complete()
    }

    /// Copy of the result if fulfilled and not yet taken; no side effects
    pub fn peek(&self) -> Option<OffloadResult<T>>
    where
        T: Clone,
    {
        if self.done || !self.slot.is_complete() {
            return None;
        }
        self.slot.value.lock().clone()
    }

    /// Take the result if it is ready, without blocking
    pub fn try_take(&mut self) -> Option<OffloadResult<T>> {
        if self.done {
            return None;
        }
        let result = self.slot.take()?;
        self.done = true;
        Some(result)
    }

    /// Block the current OS thread until the result is ready
    ///
    /// Light-tasks must `.await` instead: on a scheduler worker thread this
    /// returns `WouldBlockScheduler` rather than blocking the worker.
    pub fn wait(self) -> OffloadResult<T> {
        self.wait_until(None)
    }

    /// Like `wait`, giving up with `Timeout` after `timeout`
    ///
    /// The work keeps running; its result is dropped unobserved.
    pub fn wait_timeout(self, timeout: Duration) -> OffloadResult<T> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(mut self, deadline: Option<Instant>) -> OffloadResult<T> {
        if let Some(result) = self.try_take() {
            return result;
        }
        if self.done {
            return Err(OffloadError::AlreadyTaken);
        }
        if is_worker_thread() {
            return Err(OffloadError::WouldBlockScheduler);
        }

        let parker = Parker::new();
        let continuation = Continuation::Thread(parker.unparker().clone());
        if self.slot.register(continuation).is_ok() {
            while !self.slot.is_complete() {
                match deadline {
                    None => parker.park(),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(OffloadError::Timeout);
                        }
                        parker.park_timeout(deadline - now);
                    }
                }
            }
        }

        self.try_take().unwrap_or(Err(OffloadError::AlreadyTaken))
    }

    /// Run `callback` with the result once it is ready
    ///
    /// Runs inline if the result is already there, otherwise on the thread
    /// that fulfils the promise.
    pub fn on_ready<F>(mut self, callback: F)
    where
        F: FnOnce(OffloadResult<T>) + Send + 'static,
        T: Send + 'static,
    {
        if self.done {
            callback(Err(OffloadError::AlreadyTaken));
            return;
        }
        self.done = true;

        let slot = self.slot.clone();
        let continuation = Continuation::Callback(Box::new(move || {
            callback(slot.take().unwrap_or(Err(OffloadError::AlreadyTaken)));
        }));
        if let Err(continuation) = self.slot.register(continuation) {
            continuation.resume();
        }
    }

    /// Await with a deadline; resolves to `Timeout` if it passes first
    ///
    /// Must be polled on a scheduler worker thread.
    pub fn timeout(self, duration: Duration) -> Timeout<T> {
        Timeout {
            future: self,
            sleep: Sleep::new(duration),
        }
    }
}

impl<T> Future for PromiseFuture<T> {
    type Output = OffloadResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(OffloadError::AlreadyTaken));
        }
        if let Some(result) = this.try_take() {
            return Poll::Ready(result);
        }

        // Suspension point: the light-task yields here until resumed.
        match this.slot.register(Continuation::Waker(cx.waker().clone())) {
            Ok(()) => Poll::Pending,
            Err(_) => Poll::Ready(this.try_take().unwrap_or(Err(OffloadError::AlreadyTaken))),
        }
    }
}

impl<T> Drop for PromiseFuture<T> {
    fn drop(&mut self) {
        if !self.done {
            self.slot.close();
        }
    }
}

impl<T> fmt::Debug for PromiseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseFuture")
            .field("status", &self.status())
            .finish()
    }
}

/// `PromiseFuture` with a deadline
#[must_use = "a Timeout does nothing unless awaited"]
pub struct Timeout<T> {
    future: PromiseFuture<T>,
    sleep: Sleep,
}

impl<T> Future for Timeout<T> {
    type Output = OffloadResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(result) = Pin::new(&mut this.future).poll(cx) {
            return Poll::Ready(result);
        }
        match Pin::new(&mut this.sleep).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(OffloadError::Timeout)),
            Poll::Pending => Poll::Pending,
        }
    }
}
