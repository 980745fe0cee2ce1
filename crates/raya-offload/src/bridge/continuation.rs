//! Continuations stored in a promise while its waiter is suspended

use crossbeam::sync::Unparker;
use std::fmt;
use std::task::Waker;

/// How to resume whoever is waiting on a promise
///
/// A continuation never owns the light-task it resumes: scheduler wakers
/// only hold a weak task reference.
pub enum Continuation {
    /// Resume a suspended light-task through its scheduler
    Waker(Waker),
    /// Unpark an OS thread blocked in `PromiseFuture::wait`
    Thread(Unparker),
    /// Run a callback on the fulfilling thread
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl Continuation {
    /// Fire the continuation, consuming it
    pub fn resume(self) {
        match self {
            Continuation::Waker(waker) => waker.wake(),
            Continuation::Thread(unparker) => unparker.unpark(),
            Continuation::Callback(callback) => callback(),
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::Waker(_) => f.write_str("Continuation::Waker"),
            Continuation::Thread(_) => f.write_str("Continuation::Thread"),
            Continuation::Callback(_) => f.write_str("Continuation::Callback"),
        }
    }
}
