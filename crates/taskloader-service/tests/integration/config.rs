use std::io::Write;
use std::time::Duration;

use taskloader_service::cache::HistoryPolicy;
use taskloader_service::config::Config;
use taskloader_service::loader::Loader;
use taskloader_service::pools::Pools;

use crate::SlowSquare;

#[tokio::test(start_paused = true)]
async fn test_loader_from_config_file() {
    taskloader_test::setup();
    let dir = taskloader_test::tempdir();
    let path = dir.path().join("taskloader.yml");

    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        "loader:\n  max_concurrent_tasks: 1\ncache:\n  bound: 1\n  tolerance: 0\n  history: on_put"
    )
    .unwrap();

    let config = Config::get(Some(path.as_path())).unwrap();
    assert_eq!(config.loader.max_concurrent_tasks, 1);
    assert_eq!(config.cache.history, HistoryPolicy::OnPut);

    let loader = Loader::new(SlowSquare::default(), &config, &Pools::current());
    let mut first = loader.submit(2, Duration::from_millis(10)).unwrap();
    let mut second = loader.submit(3, Duration::from_millis(10)).unwrap();
    assert_eq!(first.outcome().await.unwrap().into_value(), Some(4));
    assert_eq!(second.outcome().await.unwrap().into_value(), Some(9));

    assert_eq!(loader.stats().await.cached_entries, 1);
}
