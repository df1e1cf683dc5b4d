//! The single owner of all loader bookkeeping.
//!
//! Submissions, cancellations and the reports of background work all arrive as [`Message`]s and
//! are processed strictly one after another, so none of the state below needs a lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::driver::{ResultCache, TaskContext, TaskDriver, call_hook};
use super::outcome::{CancelScope, Cancellation, QueryOutcome, TaskOrigin};
use super::query::{Dispatcher, Query, QueryId};
use super::task::{Task, TaskId, TaskInfo, WorkHandle};
use super::LoaderStats;
use crate::cache::HistoryCache;
use crate::config::Config;
use crate::error::WorkError;
use crate::utils::futures::{CallOnDrop, m, measure};

pub(crate) enum Message<D: TaskDriver> {
    Submit {
        query: Query<D>,
        params: D::Params,
        mkey: D::Key,
    },
    CancelQuery {
        id: QueryId,
        reason: Option<String>,
        cancel_entire_task: bool,
    },
    CancelKey {
        mkey: D::Key,
        params: D::Params,
        reason: Option<String>,
    },
    TaskStarted {
        mkey: D::Key,
        task_id: TaskId,
    },
    Progress {
        mkey: D::Key,
        task_id: TaskId,
        progress: D::Progress,
    },
    TaskFinished {
        mkey: D::Key,
        task_id: TaskId,
        result: Result<D::Output, WorkError>,
    },
    Release {
        reason: Option<String>,
        done: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<LoaderStats>,
    },
    TaskInfo {
        mkey: D::Key,
        reply: oneshot::Sender<Option<TaskInfo>>,
    },
}

pub(crate) struct Actor<D: TaskDriver> {
    driver: Arc<D>,
    cache: ResultCache<D>,
    bound: usize,
    tolerance: usize,
    /// The tasks that have not reached a terminal state, by mutated key.
    ongoing: FxHashMap<D::Key, Task<D>>,
    /// Cancelled tasks whose work has not yet reported its exit.
    draining: FxHashSet<TaskId>,
    /// Maps every attached query to the mutated key of its task.
    queries: FxHashMap<QueryId, D::Key>,
    next_task_id: u64,
    limiter: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    worker: Handle,
    dispatcher: Dispatcher<D::Output, D::Progress>,
    messages: mpsc::WeakUnboundedSender<Message<D>>,
    released: bool,
    release_waiters: Vec<oneshot::Sender<()>>,
}

impl<D: TaskDriver> Actor<D> {
    pub(crate) fn new(
        driver: Arc<D>,
        config: &Config,
        worker: Handle,
        dispatcher: Dispatcher<D::Output, D::Progress>,
        messages: mpsc::WeakUnboundedSender<Message<D>>,
    ) -> Self {
        Self {
            driver,
            cache: HistoryCache::new(config.cache.history),
            bound: config.cache.bound,
            tolerance: config.cache.tolerance,
            ongoing: FxHashMap::default(),
            draining: FxHashSet::default(),
            queries: FxHashMap::default(),
            next_task_id: 0,
            limiter: Arc::new(Semaphore::new(config.loader.max_concurrent_tasks.max(1))),
            running: Arc::new(AtomicUsize::new(0)),
            worker,
            dispatcher,
            messages,
            released: false,
            release_waiters: Vec::new(),
        }
    }

    /// Processes messages until every sender is gone.
    pub(crate) async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Message<D>>) {
        while let Some(message) = receiver.recv().await {
            self.handle(message);
        }
        tracing::debug!("Loader actor stopped");
    }

    fn handle(&mut self, message: Message<D>) {
        match message {
            Message::Submit {
                query,
                params,
                mkey,
            } => self.submit(query, params, mkey),
            Message::CancelQuery {
                id,
                reason,
                cancel_entire_task,
            } => self.cancel_query(id, reason, cancel_entire_task),
            Message::CancelKey {
                mkey,
                params,
                reason,
            } => {
                if self.ongoing.contains_key(&mkey) {
                    self.cancel_task(&mkey, Cancellation::new(CancelScope::Task, reason));
                } else {
                    call_hook("clear_result_from_cache", || {
                        self.driver
                            .clear_result_from_cache(&mut self.cache, &mkey, &params)
                    });
                }
            }
            Message::TaskStarted { mkey, task_id } => {
                if let Some(task) = self.current_task(&mkey, task_id) {
                    task.mark_running();
                }
            }
            Message::Progress {
                mkey,
                task_id,
                progress,
            } => {
                let Some(task) = self
                    .ongoing
                    .get_mut(&mkey)
                    .filter(|task| task.id() == task_id)
                else {
                    return;
                };
                let driver = &self.driver;
                let progress =
                    call_hook("on_progress", || driver.on_progress(task.key(), progress)).flatten();
                if let Some(progress) = progress {
                    task.publish_progress(progress, &self.dispatcher);
                }
            }
            Message::TaskFinished {
                mkey,
                task_id,
                result,
            } => self.task_finished(mkey, task_id, result),
            Message::Release { reason, done } => self.release(reason, done),
            Message::Stats { reply } => {
                reply.send(self.stats()).ok();
            }
            Message::TaskInfo { mkey, reply } => {
                reply.send(self.ongoing.get(&mkey).map(Task::info)).ok();
            }
        }
    }

    fn current_task(&mut self, mkey: &D::Key, task_id: TaskId) -> Option<&mut Task<D>> {
        self.ongoing
            .get_mut(mkey)
            .filter(|task| task.id() == task_id)
    }

    fn submit(&mut self, query: Query<D>, params: D::Params, mkey: D::Key) {
        if self.released {
            let cancellation = Cancellation::new(CancelScope::Loader, None);
            query.finish(QueryOutcome::Cancelled(cancellation), &self.dispatcher);
            return;
        }

        let lookup = call_hook("query_cache", || {
            self.driver.query_cache(&mut self.cache, &mkey, &params)
        });
        // lookups may have added the key to the history
        self.trim_cache();
        match lookup {
            Some(Some(value)) => {
                metric!(counter("loader.cache.hit") += 1);
                query.finish(QueryOutcome::Cached(value), &self.dispatcher);
                return;
            }
            Some(None) => {}
            None => {
                let outcome = QueryOutcome::Failed {
                    error: WorkError::Panicked,
                    origin: TaskOrigin::Started,
                };
                query.finish(outcome, &self.dispatcher);
                return;
            }
        }

        let query_id = query.id();
        if let Some(task) = self.ongoing.get_mut(&mkey) {
            metric!(counter("loader.task.joined") += 1);
            tracing::trace!(query = %query_id, task = %task.id(), "Joining ongoing task");
            task.attach_query(query, TaskOrigin::Joined, &self.dispatcher);
            self.queries.insert(query_id, mkey);
            return;
        }

        let Some(messages) = self.messages.upgrade() else {
            // Only possible while the last sender is being dropped.
            let cancellation = Cancellation::new(CancelScope::Loader, None);
            query.finish(QueryOutcome::Cancelled(cancellation), &self.dispatcher);
            return;
        };

        let task_id = TaskId(self.next_task_id);
        self.next_task_id += 1;

        let mut task = Task::new(task_id, query.key().clone(), params, mkey.clone());
        task.attach_query(query, TaskOrigin::Started, &self.dispatcher);
        if let Err(err) = task.start(|task| self.spawn_work(task, messages)) {
            // A fresh task has neither been started nor terminated.
            tracing::error!(error = &err as &dyn std::error::Error, "Failed to start task");
            return;
        }

        metric!(counter("loader.task.started") += 1);
        tracing::debug!(task = %task_id, key = ?mkey, "Started task");

        self.queries.insert(query_id, mkey.clone());
        self.ongoing.insert(mkey, task);
        metric!(gauge("loader.tasks.ongoing") = self.ongoing.len() as u64);
    }

    /// Spawns the background work of `task` onto the worker pool.
    ///
    /// The work waits for a worker slot first. Its outcome, including panics and aborts, is
    /// reported back as [`Message::TaskFinished`].
    fn spawn_work(&self, task: &Task<D>, messages: mpsc::UnboundedSender<Message<D>>) -> WorkHandle {
        let task_id = task.id();
        let mkey = task.mkey().clone();
        let token = CancellationToken::new();

        let progress = {
            let messages = messages.clone();
            let mkey = mkey.clone();
            Arc::new(move |progress: D::Progress| {
                let message = Message::Progress {
                    mkey: mkey.clone(),
                    task_id,
                    progress,
                };
                messages.send(message).ok();
            })
        };
        let ctx = TaskContext::new(token.clone(), progress);

        let work = {
            let driver = Arc::clone(&self.driver);
            let limiter = Arc::clone(&self.limiter);
            let running = Arc::clone(&self.running);
            let messages = messages.clone();
            let mkey = mkey.clone();
            let key = task.key().clone();
            let params = task.params().clone();

            async move {
                // The semaphore is never closed.
                let _permit = limiter.acquire_owned().await.ok();
                messages
                    .send(Message::TaskStarted {
                        mkey,
                        task_id,
                    })
                    .ok();

                let current = running.fetch_add(1, Ordering::Relaxed) + 1;
                metric!(gauge("loader.tasks.running") = current as u64);
                let _running = CallOnDrop::new(move || {
                    let current = running.fetch_sub(1, Ordering::Relaxed) - 1;
                    metric!(gauge("loader.tasks.running") = current as u64);
                });

                driver.compute(key, params, ctx).await
            }
        };
        let work = measure("loader.compute", m::work, work);
        let join = self
            .worker
            .spawn(work.bind_hub(Hub::new_from_top(Hub::current())));
        let abort = join.abort_handle();

        self.worker.spawn(async move {
            let result = match join.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    tracing::error!(task = %task_id, "Task work panicked");
                    Err(WorkError::Panicked)
                }
                Err(_) => Err(WorkError::Interrupted),
            };
            messages
                .send(Message::TaskFinished {
                    mkey,
                    task_id,
                    result,
                })
                .ok();
        });

        WorkHandle { token, abort }
    }

    fn cancel_query(&mut self, id: QueryId, reason: Option<String>, cancel_entire_task: bool) {
        let Some(mkey) = self.queries.get(&id).cloned() else {
            tracing::trace!(query = %id, "Query already finished, ignoring cancellation");
            return;
        };
        let Some(task) = self.ongoing.get_mut(&mkey) else {
            self.queries.remove(&id);
            return;
        };

        if cancel_entire_task || task.query_count() <= 1 {
            let cancellation = Cancellation {
                scope: CancelScope::Task,
                reason,
                all_queries_dropped: !cancel_entire_task,
            };
            self.cancel_task(&mkey, cancellation);
            return;
        }

        if let Some(query) = task.detach_query(id) {
            metric!(counter("loader.query.cancelled") += 1);
            tracing::trace!(query = %id, task = %task.id(), "Detached cancelled query");
            self.queries.remove(&id);
            let cancellation = Cancellation::new(CancelScope::Query, reason);
            query.finish(QueryOutcome::Cancelled(cancellation), &self.dispatcher);
        }
    }

    /// Cancels the ongoing task for `mkey` and notifies all of its queries.
    fn cancel_task(&mut self, mkey: &D::Key, cancellation: Cancellation) {
        let Some(mut task) = self.ongoing.remove(mkey) else {
            return;
        };

        if task.cancel(&self.driver) {
            metric!(counter("loader.task.cancelled") += 1, "scope" => scope_tag(cancellation.scope));
            tracing::debug!(
                task = %task.id(),
                key = ?mkey,
                reason = cancellation.reason.as_deref(),
                "Cancelled task",
            );
        }
        if task.is_spawned() {
            self.draining.insert(task.id());
        }
        for id in task.finish_cancelled(cancellation, &self.dispatcher) {
            self.queries.remove(&id);
        }

        metric!(gauge("loader.tasks.ongoing") = self.ongoing.len() as u64);
        self.check_released();
    }

    fn task_finished(
        &mut self,
        mkey: D::Key,
        task_id: TaskId,
        result: Result<D::Output, WorkError>,
    ) {
        if self.draining.remove(&task_id) {
            tracing::trace!(task = %task_id, "Cancelled work exited");
            self.check_released();
            return;
        }
        if self.current_task(&mkey, task_id).is_none() {
            return;
        }
        let Some(mut task) = self.ongoing.remove(&mkey) else {
            return;
        };

        if let Ok(value) = &result {
            let params = task.params();
            call_hook("cache_result", || {
                self.driver.cache_result(&mut self.cache, &mkey, params, value)
            });
            // Results stored without entering the history would never be evicted.
            if self.cache.contains_key(&mkey) && !self.cache.in_history(&mkey) {
                self.cache.push_key_in_history(mkey.clone());
            }
        }
        self.trim_cache();
        match &result {
            Err(error) if !error.is_interruption() => {
                tracing::error!(
                    task = %task_id,
                    key = ?mkey,
                    error = error as &dyn std::error::Error,
                    "Task failed",
                );
            }
            _ => {}
        }

        metric!(histogram("loader.task.queries") = task.query_count() as u64);
        for id in task.finish(result, &self.dispatcher) {
            self.queries.remove(&id);
        }
        tracing::debug!(
            task = %task_id,
            key = ?mkey,
            state = ?task.state(),
            elapsed = ?task.elapsed(),
            "Task finished",
        );

        metric!(gauge("loader.tasks.ongoing") = self.ongoing.len() as u64);
        self.check_released();
    }

    /// Brings the cache back into its bounds and hands evicted values to the driver.
    fn trim_cache(&mut self) {
        let evicted = self.cache.keep_last(self.bound, self.tolerance);
        if !evicted.is_empty() {
            metric!(counter("loader.cache.evicted") += evicted.len() as i64);
            call_hook("evicted", || self.driver.evicted(evicted));
        }
    }

    fn release(&mut self, reason: Option<String>, done: oneshot::Sender<()>) {
        if !self.released {
            self.released = true;
            let keys: Vec<_> = self.ongoing.keys().cloned().collect();
            tracing::debug!(tasks = keys.len(), "Releasing loader");
            for mkey in keys {
                self.cancel_task(
                    &mkey,
                    Cancellation::new(CancelScope::Loader, reason.clone()),
                );
            }
        }
        self.release_waiters.push(done);
        self.check_released();
    }

    /// Resolves pending releases once no work is left.
    fn check_released(&mut self) {
        if self.released && self.ongoing.is_empty() && self.draining.is_empty() {
            for done in self.release_waiters.drain(..) {
                done.send(()).ok();
            }
        }
    }

    fn stats(&self) -> LoaderStats {
        LoaderStats {
            ongoing_tasks: self.ongoing.len(),
            draining_tasks: self.draining.len(),
            attached_queries: self.queries.len(),
            cached_entries: self.cache.len(),
            history_len: self.cache.history_len(),
            released: self.released,
        }
    }
}

fn scope_tag(scope: CancelScope) -> &'static str {
    match scope {
        CancelScope::Query => "query",
        CancelScope::Task => "task",
        CancelScope::Loader => "loader",
    }
}
