use std::sync::Arc;

use thiserror::Error;

/// Misuse of the [`Loader`](crate::loader::Loader) API surface.
///
/// These are returned synchronously at the call site and never travel through query events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoaderError {
    /// The loader was released and does not accept any more work.
    #[error("loader has been released")]
    Released,
}

/// An invalid transition of a task's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskStateError {
    /// The task's background work was already started once.
    #[error("task has already been started")]
    AlreadyStarted,
    /// The task reached a terminal state before it was started.
    #[error("task has already terminated")]
    Terminated,
}

/// An error produced by the background work of a task.
///
/// [`Interrupted`](Self::Interrupted) is special: it is never reported as a failure, but
/// translated into a cancellation of the task.
#[derive(Debug, Clone, Error)]
pub enum WorkError {
    /// The work noticed that it was cancelled, or it was aborted while waiting.
    #[error("work was interrupted")]
    Interrupted,
    /// The work panicked.
    #[error("work panicked")]
    Panicked,
    /// The work failed.
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl WorkError {
    /// Wraps an arbitrary error as a work failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Failed(Arc::new(err.into()))
    }

    /// Whether this error should be treated as a cancellation rather than a failure.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

impl From<anyhow::Error> for WorkError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}
