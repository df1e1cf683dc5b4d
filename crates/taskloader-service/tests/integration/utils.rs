use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use taskloader_service::config::Config;
use taskloader_service::error::WorkError;
use taskloader_service::loader::{Loader, QueryEvent, QueryHandle, TaskContext, TaskDriver};
use taskloader_service::pools::Pools;
use taskloader_test as test;

/// Setup tests and create a loader on the current runtime.
///
/// The `update_config` closure can modify any default configuration before the loader is
/// created.
pub fn setup_loader<D: TaskDriver>(driver: D, update_config: impl FnOnce(&mut Config)) -> Loader<D> {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    Loader::new(driver, &config, &Pools::current())
}

#[derive(Debug, Default)]
pub struct Counters {
    pub computed: AtomicUsize,
    pub interrupted: AtomicUsize,
}

/// Squares its key after sleeping for the duration given as parameter.
///
/// Reports 0% progress when it starts and 50% halfway through.
#[derive(Debug, Default)]
pub struct SlowSquare {
    pub counters: Arc<Counters>,
}

impl SlowSquare {
    pub fn computed(&self) -> usize {
        self.counters.computed.load(Ordering::SeqCst)
    }
}

impl TaskDriver for SlowSquare {
    type Key = u64;
    type Params = Duration;
    type Output = u64;
    type Progress = u8;

    fn compute(
        &self,
        key: u64,
        delay: Duration,
        ctx: TaskContext<u8>,
    ) -> BoxFuture<'static, Result<u64, WorkError>> {
        self.counters.computed.fetch_add(1, Ordering::SeqCst);
        let counters = Arc::clone(&self.counters);

        async move {
            for percent in [0, 50] {
                ctx.progress(percent);
                tokio::select! {
                    _ = ctx.cancelled() => {
                        counters.interrupted.fetch_add(1, Ordering::SeqCst);
                        return Err(WorkError::Interrupted);
                    }
                    _ = tokio::time::sleep(delay / 2) => {}
                }
            }
            Ok(key * key)
        }
        .boxed()
    }
}

/// Receives all events of a query and renders them as strings.
pub async fn collect_events<D>(handle: &mut QueryHandle<D>) -> Vec<String>
where
    D: TaskDriver,
    D::Output: std::fmt::Debug,
    D::Progress: std::fmt::Debug,
{
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(match event {
            QueryEvent::Progress(progress) => format!("progress {progress:?}"),
            QueryEvent::Finished(outcome) => match outcome.value() {
                Some(value) => format!("{} {value:?}", outcome.kind()),
                None => outcome.kind().to_owned(),
            },
        });
    }
    events
}
