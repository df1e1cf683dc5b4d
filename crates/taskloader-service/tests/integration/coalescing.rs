use std::time::Duration;

use taskloader_service::config::Config;
use taskloader_service::loader::{CancelScope, Loader, TaskOrigin};
use taskloader_service::pools::PoolRuntimes;

use crate::{SlowSquare, collect_events, setup_loader};

const DELAY: Duration = Duration::from_millis(100);

#[test]
fn test_dedicated_pools() {
    taskloader_test::setup();
    let config = Config::default();
    let runtimes = PoolRuntimes::from_config(&config.loader).unwrap();
    let pools = runtimes.pools();

    let computed = runtimes.block_on(async {
        let loader = Loader::new(SlowSquare::default(), &config, &pools);

        let mut fours: Vec<_> = (0..3).map(|_| loader.submit(4, DELAY).unwrap()).collect();
        let mut five = loader.submit(5, DELAY).unwrap();

        for (index, query) in fours.iter_mut().enumerate() {
            let outcome = query.outcome().await.unwrap();
            let origin = match index {
                0 => TaskOrigin::Started,
                _ => TaskOrigin::Joined,
            };
            assert_eq!(outcome.origin(), Some(origin));
            assert_eq!(outcome.into_value(), Some(16));
        }
        assert_eq!(five.outcome().await.unwrap().into_value(), Some(25));

        loader.release_all(None).await.unwrap();
        loader.driver().computed()
    });
    assert_eq!(computed, 2);

    runtimes.shutdown(&config.loader);
}

#[tokio::test(start_paused = true)]
async fn test_progress_then_outcome() {
    let loader = setup_loader(SlowSquare::default(), |_| {});

    let mut query = loader.submit(4, DELAY).unwrap();
    assert_eq!(
        collect_events(&mut query).await,
        ["progress 0", "progress 50", "success 16"]
    );

    let mut cached = loader.submit(4, DELAY).unwrap();
    assert_eq!(collect_events(&mut cached).await, ["cached 16"]);
}

#[tokio::test(start_paused = true)]
async fn test_caller_timeout_cancels_query() {
    let loader = setup_loader(SlowSquare::default(), |_| {});

    let mut query = loader.submit(3, Duration::from_secs(10)).unwrap();
    let timeout = tokio::time::timeout(Duration::from_secs(1), query.outcome()).await;
    assert!(timeout.is_err());

    query.cancel(Some("timed out".into()), false);
    let outcome = query.outcome().await.unwrap();
    let cancellation = outcome.cancellation().unwrap();
    assert_eq!(cancellation.scope, CancelScope::Task);
    assert_eq!(cancellation.reason.as_deref(), Some("timed out"));
    assert!(cancellation.all_queries_dropped);

    loader.release_all(None).await.unwrap();
    let stats = loader.stats().await;
    assert_eq!(stats.ongoing_tasks, 0);
    assert_eq!(stats.draining_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cache_stays_bounded() {
    let loader = setup_loader(SlowSquare::default(), |config| {
        config.cache.bound = 20;
        config.cache.tolerance = 4;
    });

    for key in 0..30 {
        let mut query = loader.submit(key, DELAY).unwrap();
        query.outcome().await.unwrap();
        assert!(loader.stats().await.cached_entries <= 24);
    }
    assert_eq!(loader.stats().await.cached_entries, 20);

    // The most recent keys are still cached.
    let mut recent = loader.submit(29, DELAY).unwrap();
    assert_eq!(collect_events(&mut recent).await, ["cached 841"]);
    assert_eq!(loader.driver().computed(), 30);
}
