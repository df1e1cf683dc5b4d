use crate::error::WorkError;

/// How a query got attached to the task that produced its outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOrigin {
    /// The query created the task.
    Started,
    /// The query joined a task that was already running for the same mutated key.
    Joined,
}

/// What a cancellation applied to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelScope {
    /// Only this query was cancelled, the task keeps running for the other queries.
    Query,
    /// The whole task was cancelled and all of its queries were notified.
    Task,
    /// The loader was released.
    Loader,
}

/// Details about a cancellation, delivered as part of [`QueryOutcome::Cancelled`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cancellation {
    pub scope: CancelScope,
    /// Human readable reason given by whoever initiated the cancellation.
    pub reason: Option<String>,
    /// Set when the task was cancelled because its last query went away.
    pub all_queries_dropped: bool,
}

impl Cancellation {
    pub fn new(scope: CancelScope, reason: Option<String>) -> Self {
        Self {
            scope,
            reason,
            all_queries_dropped: false,
        }
    }
}

/// The terminal outcome of a query. Every query receives exactly one.
#[derive(Clone, Debug)]
pub enum QueryOutcome<T> {
    /// The driver answered the request before any task was created.
    PreExecuted(T),
    /// The value was served from the loader's cache.
    Cached(T),
    /// The task's work finished successfully.
    Success { value: T, origin: TaskOrigin },
    /// The task's work failed.
    Failed { error: WorkError, origin: TaskOrigin },
    /// The query or its task was cancelled.
    Cancelled(Cancellation),
}

impl<T> QueryOutcome<T> {
    /// The produced value, if there is one.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::PreExecuted(value) | Self::Cached(value) | Self::Success { value, .. } => {
                Some(value)
            }
            Self::Failed { .. } | Self::Cancelled(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::PreExecuted(value) | Self::Cached(value) | Self::Success { value, .. } => {
                Some(value)
            }
            Self::Failed { .. } | Self::Cancelled(_) => None,
        }
    }

    /// How the query was attached to its task, if a task was involved at all.
    pub fn origin(&self) -> Option<TaskOrigin> {
        match self {
            Self::Success { origin, .. } | Self::Failed { origin, .. } => Some(*origin),
            _ => None,
        }
    }

    pub fn cancellation(&self) -> Option<&Cancellation> {
        match self {
            Self::Cancelled(cancellation) => Some(cancellation),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// A short tag describing the kind of outcome, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PreExecuted(_) => "pre_executed",
            Self::Cached(_) => "cached",
            Self::Success { .. } => "success",
            Self::Failed { .. } => "failed",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

/// An event delivered to a query.
///
/// A query receives any number of [`Progress`](Self::Progress) events, followed by exactly one
/// [`Finished`](Self::Finished) event.
#[derive(Clone, Debug)]
pub enum QueryEvent<T, P> {
    Progress(P),
    Finished(QueryOutcome<T>),
}

impl<T, P> QueryEvent<T, P> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}
