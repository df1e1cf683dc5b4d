use std::fmt;
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::driver::{TaskDriver, call_hook};
use super::outcome::{CancelScope, Cancellation, QueryOutcome, TaskOrigin};
use super::query::{Dispatcher, Query, QueryId};
use crate::error::{TaskStateError, WorkError};

/// Identifies a task within its loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Created, but its work has not begun yet.
    Idle,
    /// The work holds a worker slot and is executing.
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// A snapshot of an ongoing task, see [`Loader::task_info`](super::Loader::task_info).
#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub id: TaskId,
    pub state: TaskState,
    /// Number of queries currently attached.
    pub queries: usize,
    pub created_at: Instant,
    /// When the work acquired a worker slot.
    pub started_at: Option<Instant>,
    /// Whether the task has reported progress.
    pub has_progress: bool,
}

/// The cancellation handles of spawned work.
#[derive(Debug)]
pub(crate) struct WorkHandle {
    pub token: CancellationToken,
    pub abort: AbortHandle,
}

struct AttachedQuery<D: TaskDriver> {
    query: Query<D>,
    origin: TaskOrigin,
}

/// The single unit of work for a mutated key.
pub(crate) struct Task<D: TaskDriver> {
    id: TaskId,
    /// Key and parameters of the query that created the task.
    key: D::Key,
    params: D::Params,
    mkey: D::Key,
    state: TaskState,
    created_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    queries: Vec<AttachedQuery<D>>,
    work: Option<WorkHandle>,
    last_progress: Option<D::Progress>,
}

impl<D: TaskDriver> Task<D> {
    pub(crate) fn new(id: TaskId, key: D::Key, params: D::Params, mkey: D::Key) -> Self {
        Self {
            id,
            key,
            params,
            mkey,
            state: TaskState::Idle,
            created_at: Instant::now(),
            started_at: None,
            finished_at: None,
            queries: Vec::new(),
            work: None,
            last_progress: None,
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn key(&self) -> &D::Key {
        &self.key
    }

    pub(crate) fn params(&self) -> &D::Params {
        &self.params
    }

    pub(crate) fn mkey(&self) -> &D::Key {
        &self.mkey
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state
    }

    /// Whether work was spawned for this task, regardless of its state.
    pub(crate) fn is_spawned(&self) -> bool {
        self.work.is_some()
    }

    pub(crate) fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Time from creation until the task reached a terminal state.
    pub(crate) fn elapsed(&self) -> Option<Duration> {
        self.finished_at
            .map(|finished| finished.duration_since(self.created_at))
    }

    pub(crate) fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            state: self.state,
            queries: self.queries.len(),
            created_at: self.created_at,
            started_at: self.started_at,
            has_progress: self.last_progress.is_some(),
        }
    }

    /// Attaches a query, replaying the latest progress to it.
    pub(crate) fn attach_query(
        &mut self,
        query: Query<D>,
        origin: TaskOrigin,
        dispatcher: &Dispatcher<D::Output, D::Progress>,
    ) {
        if let Some(progress) = &self.last_progress {
            query.progress(progress.clone(), dispatcher);
        }
        self.queries.push(AttachedQuery { query, origin });
    }

    /// Detaches a query without notifying it.
    pub(crate) fn detach_query(&mut self, id: QueryId) -> Option<Query<D>> {
        let index = self.queries.iter().position(|q| q.query.id() == id)?;
        Some(self.queries.remove(index).query)
    }

    /// Spawns the work of this task through `spawn`. This can only happen once.
    pub(crate) fn start<F>(&mut self, spawn: F) -> Result<(), TaskStateError>
    where
        F: FnOnce(&Self) -> WorkHandle,
    {
        if self.state.is_terminal() {
            return Err(TaskStateError::Terminated);
        }
        if self.work.is_some() {
            return Err(TaskStateError::AlreadyStarted);
        }
        self.work = Some(spawn(self));
        Ok(())
    }

    /// Marks the task as running once its work acquired a worker slot.
    pub(crate) fn mark_running(&mut self) {
        if self.state == TaskState::Idle {
            self.state = TaskState::Running;
            self.started_at = Some(Instant::now());
        }
    }

    /// Stores the latest progress and fans it out to all attached queries.
    pub(crate) fn publish_progress(
        &mut self,
        progress: D::Progress,
        dispatcher: &Dispatcher<D::Output, D::Progress>,
    ) {
        for attached in &self.queries {
            attached.query.progress(progress.clone(), dispatcher);
        }
        self.last_progress = Some(progress);
    }

    /// Cancels the task and its work, if it was spawned.
    ///
    /// The driver's `pre_cancel` hook only runs for tasks in the `Running` state.
    ///
    /// Returns `true` only if the task was not already in a terminal state. Queries are not
    /// notified, see [`finish_cancelled`](Self::finish_cancelled).
    pub(crate) fn cancel(&mut self, driver: &D) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let running = self.state == TaskState::Running;
        self.state = TaskState::Cancelled;
        self.finished_at = Some(Instant::now());

        if let Some(work) = &self.work {
            // Work still waiting for a worker slot never ran, so the driver has nothing to stop.
            if running {
                call_hook("pre_cancel", || driver.pre_cancel(&self.key, &self.params));
            }
            work.token.cancel();
            work.abort.abort();
        }
        true
    }

    /// Delivers the cancellation to every attached query.
    pub(crate) fn finish_cancelled(
        &mut self,
        cancellation: Cancellation,
        dispatcher: &Dispatcher<D::Output, D::Progress>,
    ) -> Vec<QueryId> {
        self.drain_queries(dispatcher, |_| {
            QueryOutcome::Cancelled(cancellation.clone())
        })
    }

    /// Completes the task with the result of its work and notifies every attached query.
    ///
    /// An interruption of the work counts as a cancellation.
    pub(crate) fn finish(
        &mut self,
        result: Result<D::Output, WorkError>,
        dispatcher: &Dispatcher<D::Output, D::Progress>,
    ) -> Vec<QueryId> {
        self.finished_at = Some(Instant::now());
        match result {
            Ok(value) => {
                self.state = TaskState::Completed;
                self.drain_queries(dispatcher, |origin| QueryOutcome::Success {
                    value: value.clone(),
                    origin,
                })
            }
            Err(WorkError::Interrupted) => {
                self.state = TaskState::Cancelled;
                let cancellation = Cancellation::new(
                    CancelScope::Task,
                    Some("work was interrupted".into()),
                );
                self.drain_queries(dispatcher, |_| {
                    QueryOutcome::Cancelled(cancellation.clone())
                })
            }
            Err(error) => {
                self.state = TaskState::Failed;
                self.drain_queries(dispatcher, |origin| QueryOutcome::Failed {
                    error: error.clone(),
                    origin,
                })
            }
        }
    }

    fn drain_queries<F>(
        &mut self,
        dispatcher: &Dispatcher<D::Output, D::Progress>,
        mut outcome: F,
    ) -> Vec<QueryId>
    where
        F: FnMut(TaskOrigin) -> QueryOutcome<D::Output>,
    {
        self.queries
            .drain(..)
            .map(|AttachedQuery { query, origin }| {
                let id = query.id();
                query.finish(outcome(origin), dispatcher);
                id
            })
            .collect()
    }
}

impl<D: TaskDriver> fmt::Debug for Task<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("key", &self.mkey)
            .field("state", &self.state)
            .field("queries", &self.queries.len())
            .finish()
    }
}
