//! Error types shared by the pool, the executor and the promise bridge

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Failure produced by an offloaded callable
///
/// Either the callable returned an error (kept as the error source;
/// `downcast_ref` recovers it) or it panicked (the panic message is kept).
#[derive(Clone, thiserror::Error)]
#[error("{}{message}", panic_prefix(.panicked))]
pub struct WorkError {
    message: String,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync>>,
    panicked: bool,
}

fn panic_prefix(panicked: &bool) -> &'static str {
    if *panicked {
        "panicked: "
    } else {
        ""
    }
}

impl WorkError {
    /// Create a work error from a plain message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            panicked: false,
        }
    }

    /// Wrap an error returned by offloaded work
    pub fn from_error<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let boxed = error.into();
        Self {
            message: boxed.to_string(),
            source: Some(Arc::from(boxed)),
            panicked: false,
        }
    }

    /// Build a work error from a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        Self {
            message,
            source: None,
            panicked: true,
        }
    }

    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the work panicked instead of returning an error
    pub fn is_panic(&self) -> bool {
        self.panicked
    }

    /// Downcast the original error returned by the work
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.source.as_deref()?.downcast_ref::<E>()
    }
}

impl fmt::Debug for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkError")
            .field("message", &self.message)
            .field("panicked", &self.panicked)
            .finish()
    }
}

/// Offload runtime errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum OffloadError {
    /// The offloaded callable returned an error or panicked
    #[error("Offloaded work failed: {0}")]
    WorkFailed(#[source] WorkError),

    /// Queued work was dropped before it ran
    #[error("Work was cancelled before it completed")]
    Cancelled,

    /// The await deadline expired before the work completed
    #[error("Timed out waiting for offloaded work")]
    Timeout,

    /// Submission after the pool was shut down
    #[error("Worker pool is shut down")]
    PoolShutdown,

    /// Bounded queue is full and the caller must not block
    #[error("Worker pool queue is full ({capacity} items)")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// A promise was fulfilled a second time (internal invariant violation)
    #[error("Promise already fulfilled")]
    AlreadyFulfilled,

    /// The scheduler is shut down or was torn down before a resume
    #[error("Scheduler is shut down")]
    SchedulerShutdown,

    /// A blocking wait was attempted on a scheduler worker thread
    #[error("Blocking wait on a scheduler worker thread")]
    WouldBlockScheduler,

    /// The result of a future was already read
    #[error("Result was already taken")]
    AlreadyTaken,

    /// The OS refused to spawn a thread
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[source] Arc<std::io::Error>),
}

impl OffloadError {
    /// Work error carried by `WorkFailed`, if any
    pub fn work_error(&self) -> Option<&WorkError> {
        match self {
            OffloadError::WorkFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Offload result
pub type OffloadResult<T> = Result<T, OffloadError>;
