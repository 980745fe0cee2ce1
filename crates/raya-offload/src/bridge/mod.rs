//! Synchronization bridge between light-tasks and OS threads
//!
//! A `Promise` is fulfilled on an IO pool thread; its `PromiseFuture` is
//! awaited by a light-task. A pending await stores the task's waker as the
//! promise's continuation and yields, so the scheduler worker thread is free
//! to run other light-tasks. Fulfilment fires the continuation, which asks
//! the scheduler to make the task runnable again.

mod continuation;
mod promise;

pub use continuation::Continuation;
pub use promise::{promise, FutureStatus, Promise, PromiseFuture, Timeout};
