//! Configuration of the loader and the binaries embedding it.
//!
//! Every section and field is optional. A missing configuration file yields the defaults, but a
//! file that exists has to contain at least one section.
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::cache::HistoryPolicy;

const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` when a user is attached to the terminal, `simplified` otherwise.
    Auto,
    Pretty,
    /// Compact lines without colors.
    Simplified,
    /// One JSON object per line.
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// One of `off`, `error`, `warn`, `info`, `debug` or `trace`.
    #[serde(deserialize_with = "deserialize_level")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Sets `RUST_BACKTRACE` when logging is initialized.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server. Falls back to `$STATSD_SERVER`.
    pub statsd: Option<String>,
    /// Prepended to the name of every metric.
    pub prefix: String,
    /// Tags attached to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "taskloader".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the loader and its worker pool.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Maximum number of tasks whose background work runs at the same time.
    ///
    /// Further tasks are created and coalesced as usual, but wait for a free slot before their
    /// work begins.
    pub max_concurrent_tasks: usize,

    /// Number of threads of the worker pool.
    ///
    /// Defaults to the number of CPUs.
    pub worker_threads: Option<usize>,

    /// How long owned pools wait for outstanding work when they are shut down.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            worker_threads: None,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Bounds of the in-memory result cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of entries kept after an eviction.
    pub bound: usize,
    /// Number of entries the cache may grow beyond `bound` before it is evicted.
    pub tolerance: usize,
    /// Which operations count as an access of an entry.
    pub history: HistoryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bound: 20,
            tolerance: 4,
            history: HistoryPolicy::OnGet,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    pub metrics: Metrics,
    /// Internal errors are reported to this DSN.
    pub sentry_dsn: Option<Dsn>,
    pub loader: LoaderConfig,
    pub cache: CacheConfig,
}

impl Config {
    /// Loads the configuration file at `path`, or the defaults if there is none.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open configuration file {}", path.display()))?;
        Self::from_reader(file)
    }

    fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut yaml = String::new();
        reader
            .read_to_string(&mut yaml)
            .context("failed reading config file")?;
        // An empty document would silently turn into the defaults.
        if yaml.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&yaml).context("failed to parse config YAML")
    }
}

fn deserialize_level<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    if !LEVELS.contains(&level.as_str()) {
        return Err(de::Error::unknown_variant(&level, LEVELS));
    }
    level.parse().map_err(de::Error::custom)
}
