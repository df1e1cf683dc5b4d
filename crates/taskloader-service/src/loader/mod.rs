//! Request coalescing on top of a [`TaskDriver`].
//!
//! A [`Loader`] turns every submission into a query. Queries whose keys mutate to the same value
//! while a task for that key is ongoing are attached to that task instead of starting a new one,
//! and all of them receive its outcome. Successful results are kept in a bounded
//! [`HistoryCache`](crate::cache::HistoryCache) and served from there until they are evicted or
//! cleared.
//!
//! Bookkeeping happens in an actor task on the `sync` pool, the work of tasks runs on the `worker`
//! pool, and query events are delivered in order from the `callback` pool, see [`Pools`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::error::LoaderError;
use crate::pools::Pools;

mod actor;
mod driver;
mod outcome;
mod query;
mod task;

#[cfg(test)]
mod tests;

use actor::{Actor, Message};
pub use driver::{ResultCache, TaskContext, TaskDriver};
pub use outcome::{CancelScope, Cancellation, QueryEvent, QueryOutcome, TaskOrigin};
use query::Dispatcher;
pub use query::{QueryBuilder, QueryHandle, QueryId, QueryListener, ReferenceLostHook};
pub use task::{TaskId, TaskInfo, TaskState};

/// A snapshot of the loader's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Tasks that have not reached a terminal state.
    pub ongoing_tasks: usize,
    /// Cancelled tasks whose work has not exited yet.
    pub draining_tasks: usize,
    /// Queries attached to ongoing tasks.
    pub attached_queries: usize,
    pub cached_entries: usize,
    /// Keys in the access history of the cache, including misses that were recorded.
    pub history_len: usize,
    pub released: bool,
}

struct LoaderInner<D: TaskDriver> {
    driver: Arc<D>,
    actor: mpsc::UnboundedSender<Message<D>>,
    dispatcher: Dispatcher<D::Output, D::Progress>,
    released: AtomicBool,
}

/// Coalesces concurrent requests for the same key into a single task.
///
/// Cloning a loader is cheap, all clones share the same tasks and cache.
pub struct Loader<D: TaskDriver> {
    inner: Arc<LoaderInner<D>>,
}

impl<D: TaskDriver> Clone for Loader<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: TaskDriver> std::fmt::Debug for Loader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("released", &self.is_released())
            .finish()
    }
}

impl<D: TaskDriver> Loader<D> {
    /// Creates a loader and spawns its actor and dispatcher onto `pools`.
    pub fn new(driver: D, config: &Config, pools: &Pools) -> Self {
        let driver = Arc::new(driver);
        let dispatcher = Dispatcher::spawn(&pools.callback);
        let (actor, messages) = mpsc::unbounded_channel();

        let state = Actor::new(
            Arc::clone(&driver),
            config,
            pools.worker.clone(),
            dispatcher.clone(),
            actor.downgrade(),
        );
        pools.sync.spawn(state.run(messages));

        Self {
            inner: Arc::new(LoaderInner {
                driver,
                actor,
                dispatcher,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Whether [`release_all`](Self::release_all) was called.
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Submits a request whose events are received through the returned handle.
    pub fn submit(&self, key: D::Key, params: D::Params) -> Result<QueryHandle<D>, LoaderError> {
        self.submit_with(key, params, QueryBuilder::new())
    }

    /// Submits a request whose events are received as configured by `builder`.
    ///
    /// The driver's [`mutate_key`](TaskDriver::mutate_key) and
    /// [`pre_execute`](TaskDriver::pre_execute) hooks run right away on the calling thread.
    /// Everything else happens asynchronously, and the outcome is delivered as an event.
    pub fn submit_with(
        &self,
        key: D::Key,
        params: D::Params,
        builder: QueryBuilder<D::Output, D::Progress>,
    ) -> Result<QueryHandle<D>, LoaderError> {
        if self.is_released() {
            return Err(LoaderError::Released);
        }
        metric!(counter("loader.submit") += 1);

        let id = QueryId::new();
        let (sink, events) = builder.build(id);
        let handle = QueryHandle::new(id, key.clone(), events, self.inner.actor.clone());

        let driver = &self.inner.driver;
        let mkey = driver.mutate_key(&key, &params);
        let query = query::Query::new(id, key, sink);

        if let Some(value) = driver.pre_execute(query.key(), &params) {
            metric!(counter("loader.pre_executed") += 1);
            query.finish(QueryOutcome::PreExecuted(value), &self.inner.dispatcher);
            return Ok(handle);
        }

        tracing::trace!(query = %id, key = ?mkey, "Submitting query");
        let message = Message::Submit {
            query,
            params,
            mkey,
        };
        if let Err(mpsc::error::SendError(message)) = self.inner.actor.send(message) {
            if let Message::Submit { query, .. } = message {
                let cancellation = Cancellation::new(CancelScope::Loader, None);
                query.finish(
                    QueryOutcome::Cancelled(cancellation),
                    &self.inner.dispatcher,
                );
            }
        }
        Ok(handle)
    }

    /// Cancels the ongoing task for the mutated key of `key` and `params`.
    ///
    /// If no task is ongoing, the driver's
    /// [`clear_result_from_cache`](TaskDriver::clear_result_from_cache) hook is called instead.
    pub fn cancel(&self, key: &D::Key, params: &D::Params, reason: Option<String>) {
        let mkey = self.inner.driver.mutate_key(key, params);
        let message = Message::CancelKey {
            mkey,
            params: params.clone(),
            reason,
        };
        self.inner.actor.send(message).ok();
    }

    /// Cancels all ongoing tasks and stops accepting submissions.
    ///
    /// Resolves once the work of every cancelled task has exited. Calling this a second time
    /// returns [`LoaderError::Released`].
    pub async fn release_all(&self, reason: Option<String>) -> Result<(), LoaderError> {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return Err(LoaderError::Released);
        }

        let (done, released) = oneshot::channel();
        if self.inner.actor.send(Message::Release { reason, done }).is_ok() {
            released.await.ok();
        }
        tracing::debug!("Loader released");
        Ok(())
    }

    /// A snapshot of the loader's bookkeeping.
    pub async fn stats(&self) -> LoaderStats {
        let (reply, stats) = oneshot::channel();
        if self.inner.actor.send(Message::Stats { reply }).is_err() {
            return LoaderStats::default();
        }
        stats.await.unwrap_or_default()
    }

    /// A snapshot of the ongoing task for the mutated key of `key` and `params`.
    pub async fn task_info(&self, key: &D::Key, params: &D::Params) -> Option<TaskInfo> {
        let mkey = self.inner.driver.mutate_key(key, params);
        let (reply, info) = oneshot::channel();
        self.inner
            .actor
            .send(Message::TaskInfo { mkey, reply })
            .ok()?;
        info.await.ok().flatten()
    }
}
