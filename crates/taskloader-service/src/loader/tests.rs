use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, join_all};
use taskloader_test::{Gate, wait_until};

use super::*;
use crate::cache::{HistoryCache, HistoryPolicy};
use crate::config::{CacheConfig, LoaderConfig};
use crate::error::WorkError;

/// Computes `"{key}:{params}"` once its gate opens.
///
/// A few keys behave differently: `instant` is answered by `pre_execute`, `fail` fails, `panic`
/// panics and `interrupt` reports an interruption. The keys `panic-lookup`, `panic-store` and
/// `panic-cancel` make the respective hooks panic.
#[derive(Default)]
pub(crate) struct TestDriver {
    pub gate: Gate,
    /// Number of progress values emitted before waiting on the gate.
    pub progress_steps: u32,
    /// Makes the parameters part of the mutated key.
    pub fold_params: bool,
    pub computed: AtomicUsize,
    pub pre_cancelled: AtomicUsize,
    pub evicted: Mutex<Vec<String>>,
}

impl TestDriver {
    pub fn open() -> Self {
        let driver = Self::default();
        driver.gate.open();
        driver
    }

    pub fn computed(&self) -> usize {
        self.computed.load(Ordering::SeqCst)
    }

    pub fn pre_cancelled(&self) -> usize {
        self.pre_cancelled.load(Ordering::SeqCst)
    }
}

impl TaskDriver for TestDriver {
    type Key = String;
    type Params = u32;
    type Output = String;
    type Progress = u32;

    fn mutate_key(&self, key: &String, params: &u32) -> String {
        match self.fold_params {
            true => format!("{key}#{params}"),
            false => key.clone(),
        }
    }

    fn pre_execute(&self, key: &String, _params: &u32) -> Option<String> {
        (key == "instant").then(|| key.clone())
    }

    fn compute(
        &self,
        key: String,
        params: u32,
        ctx: TaskContext<u32>,
    ) -> BoxFuture<'static, Result<String, WorkError>> {
        self.computed.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.clone();
        let steps = self.progress_steps;

        async move {
            for step in 0..steps {
                ctx.progress(step);
            }
            tokio::select! {
                _ = gate.wait() => {}
                _ = ctx.token().cancelled() => return Err(WorkError::Interrupted),
            }
            ctx.check()?;

            match key.as_str() {
                "fail" => Err(WorkError::failed(anyhow::anyhow!("computation failed"))),
                "panic" => panic!("computation panicked"),
                "interrupt" => Err(WorkError::Interrupted),
                _ => Ok(format!("{key}:{params}")),
            }
        }
        .boxed()
    }

    fn query_cache(
        &self,
        cache: &mut HistoryCache<String, String>,
        key: &String,
        _params: &u32,
    ) -> Option<String> {
        if key == "panic-lookup" {
            panic!("lookup panicked");
        }
        cache.get(key).cloned()
    }

    fn cache_result(
        &self,
        cache: &mut HistoryCache<String, String>,
        key: &String,
        _params: &u32,
        output: &String,
    ) {
        if key == "panic-store" {
            panic!("store panicked");
        }
        cache.put(key.clone(), output.clone());
    }

    fn evicted(&self, values: Vec<String>) {
        self.evicted.lock().unwrap().extend(values);
    }

    fn pre_cancel(&self, key: &String, _params: &u32) {
        if key == "panic-cancel" {
            panic!("pre_cancel panicked");
        }
        self.pre_cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn on_progress(&self, _key: &String, progress: u32) -> Option<u32> {
        // odd steps are internal
        (progress % 2 == 0).then_some(progress)
    }
}

fn loader(driver: TestDriver) -> Loader<TestDriver> {
    loader_with(driver, Config::default())
}

fn loader_with(driver: TestDriver, config: Config) -> Loader<TestDriver> {
    taskloader_test::setup();
    Loader::new(driver, &config, &Pools::current())
}

fn describe(event: &QueryEvent<String, u32>) -> String {
    match event {
        QueryEvent::Progress(progress) => format!("progress {progress}"),
        QueryEvent::Finished(outcome) => match outcome.value() {
            Some(value) => format!("{} {value}", outcome.kind()),
            None => outcome.kind().to_owned(),
        },
    }
}

async fn collect_events(handle: &mut QueryHandle<TestDriver>) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        let terminal = event.is_terminal();
        events.push(describe(&event));
        if terminal {
            assert!(handle.try_next_event().is_none());
        }
    }
    events
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl QueryListener<String, u32> for Recorder {
    fn on_event(&self, _query: QueryId, event: QueryEvent<String, u32>) {
        self.events.lock().unwrap().push(describe(&event));
    }
}

#[tokio::test]
async fn test_concurrent_submissions_share_one_task() {
    let loader = loader(TestDriver::default());

    let mut handles: Vec<_> = (0..10)
        .map(|_| loader.submit("a".into(), 1).unwrap())
        .collect();

    let stats = loader.stats().await;
    assert_eq!(stats.ongoing_tasks, 1);
    assert_eq!(stats.attached_queries, 10);

    loader.driver().gate.open();
    let outcomes = join_all(handles.iter_mut().map(|handle| handle.outcome())).await;

    assert_eq!(loader.driver().computed(), 1);
    for (index, outcome) in outcomes.into_iter().enumerate() {
        let outcome = outcome.unwrap();
        let origin = match index {
            0 => TaskOrigin::Started,
            _ => TaskOrigin::Joined,
        };
        assert_eq!(outcome.origin(), Some(origin));
        assert_eq!(outcome.into_value().as_deref(), Some("a:1"));
    }

    let stats = loader.stats().await;
    assert_eq!(stats.ongoing_tasks, 0);
    assert_eq!(stats.attached_queries, 0);
}

#[tokio::test]
async fn test_back_to_back_with_single_worker_slot() {
    let config = Config {
        loader: LoaderConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let loader = loader_with(TestDriver::open(), config);

    let mut first = loader.submit("K1".into(), 1).unwrap();
    let mut second = loader.submit("K1".into(), 1).unwrap();

    let first = first.outcome().await.unwrap();
    let second = second.outcome().await.unwrap();

    assert_eq!(loader.driver().computed(), 1);
    assert_eq!(first.value(), second.value());
    assert_eq!(first.origin(), Some(TaskOrigin::Started));
    assert_eq!(second.origin(), Some(TaskOrigin::Joined));
}

#[tokio::test]
async fn test_worker_slots_limit_running_tasks() {
    let config = Config {
        loader: LoaderConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let loader = loader_with(TestDriver::default(), config);

    let mut a = loader.submit("a".into(), 1).unwrap();
    let mut b = loader.submit("b".into(), 1).unwrap();
    wait_until(|| loader.driver().computed() == 1).await;

    let running = loader.task_info(&"a".into(), &1).await.unwrap();
    assert_eq!(running.state, TaskState::Running);
    assert!(running.started_at.is_some());

    let queued = loader.task_info(&"b".into(), &1).await.unwrap();
    assert_eq!(queued.state, TaskState::Idle);
    assert_eq!(queued.started_at, None);
    assert_eq!(queued.queries, 1);

    loader.driver().gate.open();
    assert_eq!(a.outcome().await.unwrap().into_value().as_deref(), Some("a:1"));
    assert_eq!(b.outcome().await.unwrap().into_value().as_deref(), Some("b:1"));
    assert_eq!(loader.driver().computed(), 2);
    assert!(loader.task_info(&"a".into(), &1).await.is_none());
}

#[tokio::test]
async fn test_cancel_task_waiting_for_slot() {
    let config = Config {
        loader: LoaderConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let loader = loader_with(TestDriver::default(), config);

    let mut a = loader.submit("a".into(), 1).unwrap();
    let mut b = loader.submit("b".into(), 1).unwrap();
    wait_until(|| loader.driver().computed() == 1).await;
    let queued = loader.task_info(&"b".into(), &1).await.unwrap();
    assert_eq!(queued.state, TaskState::Idle);

    b.cancel(None, false);
    let outcome = b.outcome().await.unwrap();
    assert_eq!(outcome.cancellation().map(|c| c.scope), Some(CancelScope::Task));
    assert_eq!(loader.driver().pre_cancelled(), 0);

    loader.driver().gate.open();
    assert_eq!(collect_events(&mut a).await, ["success a:1"]);
    assert_eq!(loader.driver().computed(), 1);
    assert_eq!(loader.driver().pre_cancelled(), 0);
}

#[tokio::test]
async fn test_mutated_key_decides_sharing() {
    let loader = loader(TestDriver::open());
    let mut one = loader.submit("a".into(), 1).unwrap();
    let mut two = loader.submit("a".into(), 2).unwrap();
    // Params are not part of the identity, so the second query gets the creator's result.
    assert_eq!(one.outcome().await.unwrap().into_value().as_deref(), Some("a:1"));
    assert_eq!(two.outcome().await.unwrap().into_value().as_deref(), Some("a:1"));
    assert_eq!(loader.driver().computed(), 1);

    let driver = TestDriver {
        fold_params: true,
        ..TestDriver::open()
    };
    let loader = loader_with(driver, Config::default());
    let mut one = loader.submit("a".into(), 1).unwrap();
    let mut two = loader.submit("a".into(), 2).unwrap();
    assert_eq!(one.outcome().await.unwrap().into_value().as_deref(), Some("a:1"));
    assert_eq!(two.outcome().await.unwrap().into_value().as_deref(), Some("a:2"));
    assert_eq!(loader.driver().computed(), 2);
}

#[tokio::test]
async fn test_pre_execute_short_circuits() {
    let loader = loader(TestDriver::default());

    let mut query = loader.submit("instant".into(), 1).unwrap();
    assert_eq!(collect_events(&mut query).await, ["pre_executed instant"]);

    let stats = loader.stats().await;
    assert_eq!(stats.ongoing_tasks, 0);
    assert_eq!(stats.cached_entries, 0);
    assert_eq!(loader.driver().computed(), 0);
}

#[tokio::test]
async fn test_results_are_served_from_cache() {
    let loader = loader(TestDriver::open());

    let mut first = loader.submit("a".into(), 1).unwrap();
    assert_eq!(collect_events(&mut first).await, ["success a:1"]);

    let mut second = loader.submit("a".into(), 1).unwrap();
    assert_eq!(collect_events(&mut second).await, ["cached a:1"]);

    assert_eq!(loader.driver().computed(), 1);
    assert_eq!(loader.stats().await.cached_entries, 1);
}

#[tokio::test]
async fn test_cache_evicts_least_recently_used() {
    let config = Config {
        cache: CacheConfig {
            bound: 2,
            tolerance: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    let loader = loader_with(TestDriver::open(), config);

    for key in ["k0", "k1", "k2", "k3"] {
        let mut query = loader.submit(key.into(), 0).unwrap();
        query.outcome().await.unwrap();
    }

    assert_eq!(*loader.driver().evicted.lock().unwrap(), ["k0:0", "k1:0"]);
    assert_eq!(loader.stats().await.cached_entries, 2);
}

#[tokio::test]
async fn test_cache_misses_stay_bounded() {
    let config = Config {
        cache: CacheConfig {
            bound: 2,
            tolerance: 0,
            history: HistoryPolicy::OnGet,
        },
        ..Default::default()
    };
    let driver = TestDriver {
        fold_params: true,
        ..TestDriver::open()
    };
    let loader = loader_with(driver, config);

    // Every lookup records a miss, and failures never reach the cache.
    for params in 0..10 {
        let mut query = loader.submit("fail".into(), params).unwrap();
        assert_eq!(collect_events(&mut query).await, ["failed"]);
    }

    let stats = loader.stats().await;
    assert_eq!(stats.history_len, 2);
    assert_eq!(stats.cached_entries, 0);
    assert!(loader.driver().evicted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_history_stays_bounded() {
    let config = Config {
        cache: CacheConfig {
            bound: 2,
            tolerance: 0,
            history: HistoryPolicy::Manual,
        },
        ..Default::default()
    };
    let loader = loader_with(TestDriver::open(), config);

    for key in ["k0", "k1", "k2", "k3"] {
        let mut query = loader.submit(key.into(), 0).unwrap();
        query.outcome().await.unwrap();
    }

    assert_eq!(*loader.driver().evicted.lock().unwrap(), ["k0:0", "k1:0"]);
    let stats = loader.stats().await;
    assert_eq!(stats.cached_entries, 2);
    assert_eq!(stats.history_len, 2);
}

#[tokio::test]
async fn test_cancel_query_keeps_task_for_others() {
    let loader = loader(TestDriver::default());

    let mut first = loader.submit("a".into(), 1).unwrap();
    let mut second = loader.submit("a".into(), 1).unwrap();
    let mut third = loader.submit("a".into(), 1).unwrap();

    first.cancel(Some("bored".into()), false);
    let outcome = first.outcome().await.unwrap();
    assert_eq!(
        outcome.cancellation(),
        Some(&Cancellation {
            scope: CancelScope::Query,
            reason: Some("bored".into()),
            all_queries_dropped: false,
        })
    );
    assert!(first.next_event().await.is_none());

    let stats = loader.stats().await;
    assert_eq!(stats.ongoing_tasks, 1);
    assert_eq!(stats.attached_queries, 2);

    loader.driver().gate.open();
    assert_eq!(collect_events(&mut second).await, ["success a:1"]);
    assert_eq!(collect_events(&mut third).await, ["success a:1"]);
    assert_eq!(loader.driver().pre_cancelled(), 0);
}

#[tokio::test]
async fn test_cancel_last_query_cancels_task() {
    let loader = loader(TestDriver::default());

    let mut query = loader.submit("a".into(), 1).unwrap();
    wait_until(|| loader.driver().computed() == 1).await;

    query.cancel(None, false);
    let outcome = query.outcome().await.unwrap();
    assert_eq!(
        outcome.cancellation(),
        Some(&Cancellation {
            scope: CancelScope::Task,
            reason: None,
            all_queries_dropped: true,
        })
    );
    assert_eq!(loader.driver().pre_cancelled(), 1);
    assert_eq!(loader.stats().await.ongoing_tasks, 0);

    // The aborted work still has to report its exit.
    loader.release_all(None).await.unwrap();
    let stats = loader.stats().await;
    assert_eq!(stats.draining_tasks, 0);
    assert_eq!(stats.cached_entries, 0);
}

#[tokio::test]
async fn test_cancel_entire_task() {
    let loader = loader(TestDriver::default());

    let mut first = loader.submit("a".into(), 1).unwrap();
    let mut second = loader.submit("a".into(), 1).unwrap();

    second.cancel(Some("stop".into()), true);

    let expected = Cancellation {
        scope: CancelScope::Task,
        reason: Some("stop".into()),
        all_queries_dropped: false,
    };
    for query in [&mut first, &mut second] {
        let outcome = query.outcome().await.unwrap();
        assert_eq!(outcome.cancellation(), Some(&expected));
        assert!(query.next_event().await.is_none());
    }

    // A new submission starts over.
    loader.driver().gate.open();
    let mut third = loader.submit("a".into(), 1).unwrap();
    assert_eq!(collect_events(&mut third).await, ["success a:1"]);
}

#[tokio::test]
async fn test_cancel_finished_query_is_noop() {
    let loader = loader(TestDriver::open());

    let mut query = loader.submit("a".into(), 1).unwrap();
    assert_eq!(collect_events(&mut query).await, ["success a:1"]);

    query.cancel(None, true);
    let stats = loader.stats().await;
    assert_eq!(stats.cached_entries, 1);
    assert_eq!(loader.driver().pre_cancelled(), 0);
}

#[tokio::test]
async fn test_cancel_by_key() {
    let loader = loader(TestDriver::default());

    let mut query = loader.submit("a".into(), 1).unwrap();
    wait_until(|| loader.driver().computed() == 1).await;
    loader.cancel(&"a".into(), &1, Some("changed my mind".into()));
    let outcome = query.outcome().await.unwrap();
    assert_eq!(outcome.cancellation().map(|c| c.scope), Some(CancelScope::Task));

    // Without an ongoing task, cancelling clears the cached result.
    loader.driver().gate.open();
    let mut query = loader.submit("b".into(), 1).unwrap();
    query.outcome().await.unwrap();
    assert_eq!(loader.stats().await.cached_entries, 1);

    loader.cancel(&"b".into(), &1, None);
    assert_eq!(loader.stats().await.cached_entries, 0);

    let mut query = loader.submit("b".into(), 1).unwrap();
    assert_eq!(collect_events(&mut query).await, ["success b:1"]);
    assert_eq!(loader.driver().computed(), 3);
}

#[tokio::test]
async fn test_failures_are_delivered_and_not_cached() {
    let loader = loader(TestDriver::default());

    let mut first = loader.submit("fail".into(), 1).unwrap();
    let mut second = loader.submit("fail".into(), 1).unwrap();
    loader.driver().gate.open();

    let mut errors = Vec::new();
    for query in [&mut first, &mut second] {
        match query.outcome().await.unwrap() {
            QueryOutcome::Failed { error, .. } => errors.push(error.to_string()),
            outcome => panic!("unexpected outcome {outcome:?}"),
        }
    }
    assert_eq!(errors[0], errors[1]);
    insta::assert_snapshot!(errors[0], @"computation failed");

    assert_eq!(loader.stats().await.cached_entries, 0);
    let mut again = loader.submit("fail".into(), 1).unwrap();
    assert_eq!(collect_events(&mut again).await, ["failed"]);
    assert_eq!(loader.driver().computed(), 2);
}

#[tokio::test]
async fn test_panicking_work_fails_task() {
    let loader = loader(TestDriver::open());

    let mut query = loader.submit("panic".into(), 1).unwrap();
    let outcome = query.outcome().await.unwrap();
    assert!(matches!(
        outcome,
        QueryOutcome::Failed {
            error: WorkError::Panicked,
            origin: TaskOrigin::Started,
        }
    ));
    assert_eq!(loader.stats().await.ongoing_tasks, 0);
}

#[tokio::test]
async fn test_panicking_hooks_fail_only_their_query() {
    let loader = loader(TestDriver::open());

    let mut query = loader.submit("panic-lookup".into(), 1).unwrap();
    assert!(matches!(
        query.outcome().await.unwrap(),
        QueryOutcome::Failed {
            error: WorkError::Panicked,
            origin: TaskOrigin::Started,
        }
    ));
    assert_eq!(loader.driver().computed(), 0);

    // The result is still delivered, it just is not cached.
    let mut query = loader.submit("panic-store".into(), 1).unwrap();
    assert_eq!(collect_events(&mut query).await, ["success panic-store:1"]);
    assert_eq!(loader.stats().await.cached_entries, 0);

    let mut query = loader.submit("a".into(), 1).unwrap();
    assert_eq!(collect_events(&mut query).await, ["success a:1"]);
}

#[tokio::test]
async fn test_panicking_pre_cancel_still_cancels() {
    let loader = loader(TestDriver::default());

    let mut query = loader.submit("panic-cancel".into(), 1).unwrap();
    wait_until(|| loader.driver().computed() == 1).await;
    query.cancel(None, true);

    let outcome = query.outcome().await.unwrap();
    assert_eq!(outcome.cancellation().map(|c| c.scope), Some(CancelScope::Task));
    assert_eq!(loader.stats().await.ongoing_tasks, 0);

    loader.driver().gate.open();
    let mut query = loader.submit("a".into(), 1).unwrap();
    assert_eq!(collect_events(&mut query).await, ["success a:1"]);
}

#[tokio::test]
async fn test_interrupted_work_is_a_cancellation() {
    let loader = loader(TestDriver::open());

    let mut query = loader.submit("interrupt".into(), 1).unwrap();
    let outcome = query.outcome().await.unwrap();
    let cancellation = outcome.cancellation().unwrap();
    assert_eq!(cancellation.scope, CancelScope::Task);
    assert!(!cancellation.all_queries_dropped);
}

#[tokio::test]
async fn test_progress_is_fanned_out_in_order() {
    let driver = TestDriver {
        progress_steps: 4,
        ..Default::default()
    };
    let loader = loader(driver);

    let mut first = loader.submit("a".into(), 1).unwrap();
    wait_until(|| loader.driver().computed() == 1).await;

    // Joins after all progress was reported and only sees the latest value.
    let mut second = loader.submit("a".into(), 1).unwrap();
    let info = loader.task_info(&"a".into(), &1).await.unwrap();
    assert!(info.has_progress);
    assert_eq!(info.queries, 2);

    loader.driver().gate.open();
    assert_eq!(
        collect_events(&mut first).await,
        ["progress 0", "progress 2", "success a:1"]
    );
    assert_eq!(
        collect_events(&mut second).await,
        ["progress 2", "success a:1"]
    );
}

#[tokio::test]
async fn test_listeners() {
    let loader = loader(TestDriver::default());

    let strong = Arc::new(Recorder::default());
    let weak = Arc::new(Recorder::default());
    let lost = Arc::new(Mutex::new(Vec::new()));

    let mut strong_query = loader
        .submit_with(
            "a".into(),
            1,
            QueryBuilder::new().listener(Arc::clone(&strong)),
        )
        .unwrap();
    let mut weak_query = loader
        .submit_with(
            "a".into(),
            1,
            QueryBuilder::new()
                .weak_listener(&weak)
                .on_reference_lost({
                    let lost = Arc::clone(&lost);
                    move |_, event| lost.lock().unwrap().push(describe(&event))
                }),
        )
        .unwrap();

    // Listener queries do not deliver anything through their handles.
    assert!(strong_query.next_event().await.is_none());
    assert!(weak_query.next_event().await.is_none());

    drop(weak);
    loader.driver().gate.open();

    wait_until(|| !lost.lock().unwrap().is_empty()).await;
    wait_until(|| !strong.events.lock().unwrap().is_empty()).await;

    assert_eq!(*lost.lock().unwrap(), ["success a:1"]);
    assert_eq!(*strong.events.lock().unwrap(), ["success a:1"]);
}

#[tokio::test]
async fn test_dropped_handle_loses_events() {
    let loader = loader(TestDriver::open());

    let query = loader.submit("a".into(), 1).unwrap();
    drop(query);

    // The query still completes and fills the cache.
    let mut again = loader.submit("a".into(), 1).unwrap();
    let outcome = again.outcome().await.unwrap();
    assert_eq!(outcome.into_value().as_deref(), Some("a:1"));
    assert_eq!(loader.driver().computed(), 1);
}

#[tokio::test]
async fn test_release_all() {
    let loader = loader(TestDriver::default());

    let mut a = loader.submit("a".into(), 1).unwrap();
    let mut b = loader.submit("b".into(), 1).unwrap();
    wait_until(|| loader.driver().computed() == 2).await;

    loader.release_all(Some("shutdown".into())).await.unwrap();

    let expected = Cancellation {
        scope: CancelScope::Loader,
        reason: Some("shutdown".into()),
        all_queries_dropped: false,
    };
    for query in [&mut a, &mut b] {
        let outcome = query.outcome().await.unwrap();
        assert_eq!(outcome.cancellation(), Some(&expected));
    }

    let stats = loader.stats().await;
    assert_eq!(
        stats,
        LoaderStats {
            ongoing_tasks: 0,
            draining_tasks: 0,
            attached_queries: 0,
            cached_entries: 0,
            history_len: 2,
            released: true,
        }
    );
    assert_eq!(loader.driver().pre_cancelled(), 2);

    assert!(loader.is_released());
    assert_eq!(
        loader.submit("a".into(), 1).unwrap_err(),
        LoaderError::Released
    );
    assert_eq!(
        loader.release_all(None).await.unwrap_err(),
        LoaderError::Released
    );
}

#[tokio::test]
async fn test_release_idle_loader() {
    let loader = loader(TestDriver::open());
    loader.release_all(None).await.unwrap();
    assert!(loader.stats().await.released);
}
