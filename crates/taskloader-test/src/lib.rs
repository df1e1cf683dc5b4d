//! Helpers for testing the loader and its tools.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, e.g. `let _dir = taskloader_test::tempdir()`.
//!
//!  - Background work that should stay pending until the test decides otherwise can wait on a
//!    [`Gate`]. Keep in mind that opening a gate does not yield, so the test has to await
//!    something afterwards for the work to make progress.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `taskloader_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("taskloader_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A latch that holds back any number of waiters until it is opened.
///
/// Once open, a gate stays open and [`wait`](Self::wait) returns immediately.
#[derive(Clone, Debug)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open: Arc::new(open),
        }
    }

    /// Lets all current and future waiters pass.
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) {
        let mut open = self.open.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        open.wait_for(|open| *open).await.ok();
    }
}

/// Polls `condition` until it holds, yielding to other tasks in between.
///
/// # Panics
///
/// Panics if the condition does not hold within five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("condition did not hold in time");
}
