use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use taskloader_service::config::Config;
use taskloader_service::logging::ensure_log_error;
use taskloader_service::pools::PoolRuntimes;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::read_workloads;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Print logs as configured instead of discarding them.
    #[arg(long, short)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let workloads = read_workloads(&cli.workloads)?;
    let config = Config::get(cli.config.as_deref())?;

    // SAFETY: We are in a single-threaded context.
    let mut logging_guard = unsafe { logging::init(&config, cli.verbose)? };

    let runtimes =
        PoolRuntimes::from_config(&config.loader).context("failed to create runtimes")?;
    let pools = runtimes.pools();

    let result = runtimes.block_on(async {
        if let Some(udp_sink) = logging_guard.udp_sink.take() {
            tokio::spawn(udp_sink);
        }
        perform_stresstest(&config, &pools, workloads, cli.duration).await
    });

    runtimes.shutdown(&config.loader);
    result
}
