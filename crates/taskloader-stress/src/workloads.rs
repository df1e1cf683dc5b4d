use std::fs::File;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// Number of distinct keys this workload requests.
    pub keys: u64,
    /// How long a single computation takes.
    #[serde(with = "humantime_serde")]
    pub work: Duration,
    /// Cancels every n-th query right after it was submitted.
    #[serde(default)]
    pub cancel_every: Option<u64>,
}

impl Workload {
    /// The key of the `n`-th query, spread over the key space.
    pub fn key_for(&self, n: u64) -> u64 {
        n.wrapping_mul(2_654_435_761) % self.keys.max(1)
    }

    /// Whether the `n`-th query gets cancelled.
    pub fn cancels(&self, n: u64) -> bool {
        match self.cancel_every {
            Some(every) if every > 0 => n % every == every - 1,
            _ => false,
        }
    }
}

pub fn read_workloads(path: &Path) -> Result<WorkloadsConfig> {
    let file = File::open(path).context("failed to open workloads file")?;
    serde_yaml::from_reader(file).context("failed to parse workloads YAML")
}
