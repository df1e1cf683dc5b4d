//! Execution contexts of the loader.
//!
//! A [`Loader`](crate::loader::Loader) needs three contexts:
//!
//! - The `sync` context runs the actor that owns all bookkeeping. The actor is a single task, so
//!   everything it does is serialized regardless of how many threads the runtime has.
//! - The `worker` pool runs the background work of tasks.
//! - The `callback` context runs the dispatcher that delivers events to queries, one at a time.
//!
//! In tests all three can simply be the current runtime, see [`Pools::current`]. Services should
//! use [`PoolRuntimes`], which creates dedicated runtimes for each of them.

use std::io;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::config::LoaderConfig;

/// Handles to the runtimes a loader spawns its tasks on.
#[derive(Clone, Debug)]
pub struct Pools {
    pub sync: Handle,
    pub worker: Handle,
    pub callback: Handle,
}

impl Pools {
    /// Uses the runtime of the calling context for everything.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        let handle = Handle::current();
        Self {
            sync: handle.clone(),
            worker: handle.clone(),
            callback: handle,
        }
    }
}

/// Dedicated runtimes for the loader's execution contexts.
///
/// These must be created and dropped outside of any async context. Release every loader using
/// them before calling [`shutdown`](Self::shutdown).
#[derive(Debug)]
pub struct PoolRuntimes {
    sync: Runtime,
    worker: Runtime,
    callback: Runtime,
}

impl PoolRuntimes {
    pub fn from_config(config: &LoaderConfig) -> io::Result<Self> {
        let megs = 1024 * 1024;

        let sync = Builder::new_multi_thread()
            .thread_name("taskloader-sync")
            .worker_threads(1)
            .enable_all()
            .build()?;

        let mut worker = Builder::new_multi_thread();
        worker
            .thread_name("taskloader-worker")
            .enable_all()
            .thread_stack_size(8 * megs);
        if let Some(threads) = config.worker_threads {
            worker.worker_threads(threads.max(1));
        }
        let worker = worker.build()?;

        let callback = Builder::new_multi_thread()
            .thread_name("taskloader-callback")
            .worker_threads(1)
            .enable_all()
            .build()?;

        Ok(Self {
            sync,
            worker,
            callback,
        })
    }

    pub fn pools(&self) -> Pools {
        Pools {
            sync: self.sync.handle().clone(),
            worker: self.worker.handle().clone(),
            callback: self.callback.handle().clone(),
        }
    }

    /// Runs a future to completion on the sync runtime, blocking the current thread.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.sync.block_on(future)
    }

    /// Shuts down all runtimes, waiting at most `config.shutdown_timeout` for each.
    pub fn shutdown(self, config: &LoaderConfig) {
        let timeout = config.shutdown_timeout;
        self.worker.shutdown_timeout(timeout);
        self.callback.shutdown_timeout(timeout);
        self.sync.shutdown_timeout(timeout);
    }
}
