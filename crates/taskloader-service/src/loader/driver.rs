use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::cache::HistoryCache;
use crate::error::WorkError;

/// The result cache of a [`TaskDriver`], keyed by mutated keys.
pub type ResultCache<D> = HistoryCache<<D as TaskDriver>::Key, <D as TaskDriver>::Output>;

/// Customizes what a [`Loader`](super::Loader) computes and how it caches results.
///
/// The driver is the factory of the loader's tasks: every task runs [`compute`](Self::compute)
/// exactly once in the worker pool. All other hooks are called from the loader's actor, except
/// [`mutate_key`](Self::mutate_key) and [`pre_execute`](Self::pre_execute), which run on the
/// caller's thread during submission.
///
/// Hooks must not block, since they hold up all other bookkeeping of the loader. A hook that
/// panics in the actor is logged and treated as if it had not answered, see the individual hooks.
pub trait TaskDriver: Send + Sync + 'static {
    /// The key requests are submitted with.
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    /// Additional parameters of a request that are not part of its identity by default.
    type Params: Clone + Send + Sync + 'static;
    /// The value produced by a task.
    type Output: Clone + Send + Sync + 'static;
    /// Intermediate progress reported by a task.
    type Progress: Clone + Send + Sync + 'static;

    /// Derives the key that identifies the unit of work for a request.
    ///
    /// Requests with equal mutated keys share one task and one cache entry.
    fn mutate_key(&self, key: &Self::Key, _params: &Self::Params) -> Self::Key {
        key.clone()
    }

    /// Answers a request immediately, before a task is looked up or created.
    fn pre_execute(&self, _key: &Self::Key, _params: &Self::Params) -> Option<Self::Output> {
        None
    }

    /// Looks up a previously computed result for the mutated key.
    ///
    /// If this panics, the query fails with [`WorkError::Panicked`].
    fn query_cache(
        &self,
        cache: &mut HistoryCache<Self::Key, Self::Output>,
        key: &Self::Key,
        _params: &Self::Params,
    ) -> Option<Self::Output> {
        cache.get(key).cloned()
    }

    /// The background work of a task.
    ///
    /// `key` and `params` are the ones of the request that created the task. The work should
    /// return [`WorkError::Interrupted`] when it notices that `ctx` was cancelled.
    fn compute(
        &self,
        key: Self::Key,
        params: Self::Params,
        ctx: TaskContext<Self::Progress>,
    ) -> BoxFuture<'static, Result<Self::Output, WorkError>>;

    /// Stores the result of a successful task.
    fn cache_result(
        &self,
        cache: &mut HistoryCache<Self::Key, Self::Output>,
        key: &Self::Key,
        _params: &Self::Params,
        output: &Self::Output,
    ) {
        cache.put(key.clone(), output.clone());
    }

    /// Forgets a cached result. Called by [`Loader::cancel`](super::Loader::cancel) when no task
    /// is running for the mutated key.
    fn clear_result_from_cache(
        &self,
        cache: &mut HistoryCache<Self::Key, Self::Output>,
        key: &Self::Key,
        _params: &Self::Params,
    ) {
        cache.remove(key);
    }

    /// Releases values that were evicted from the cache.
    fn evicted(&self, _values: Vec<Self::Output>) {}

    /// Called right before the work of a running task is cancelled.
    ///
    /// Tasks still waiting for a worker slot are cancelled without calling this.
    fn pre_cancel(&self, _key: &Self::Key, _params: &Self::Params) {}

    /// Filters or transforms progress before it is delivered. Returning `None` suppresses it.
    fn on_progress(&self, _key: &Self::Key, progress: Self::Progress) -> Option<Self::Progress> {
        Some(progress)
    }
}

/// Runs a driver hook from the actor, turning a panic into `None`.
pub(crate) fn call_hook<R>(hook: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(_) => {
            metric!(counter("loader.hook.panicked") += 1, "hook" => hook);
            tracing::error!(hook, "Driver hook panicked");
            None
        }
    }
}

/// Gives the background work of a task access to its cancellation state and progress reporting.
pub struct TaskContext<P> {
    token: CancellationToken,
    progress: Arc<dyn Fn(P) + Send + Sync>,
}

impl<P> Clone for TaskContext<P> {
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            progress: Arc::clone(&self.progress),
        }
    }
}

impl<P> fmt::Debug for TaskContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl<P> TaskContext<P> {
    pub(crate) fn new(token: CancellationToken, progress: Arc<dyn Fn(P) + Send + Sync>) -> Self {
        Self { token, progress }
    }

    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the task is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Returns [`WorkError::Interrupted`] if the task was cancelled.
    ///
    /// Meant to be used with `?` at convenient points of long running work.
    pub fn check(&self) -> Result<(), WorkError> {
        match self.token.is_cancelled() {
            true => Err(WorkError::Interrupted),
            false => Ok(()),
        }
    }

    /// The underlying cancellation token, e.g. to hand it to other libraries.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Reports progress to every query of the task.
    ///
    /// Progress reported after the task was cancelled is dropped.
    pub fn progress(&self, progress: P) {
        if !self.token.is_cancelled() {
            (self.progress)(progress);
        }
    }
}
