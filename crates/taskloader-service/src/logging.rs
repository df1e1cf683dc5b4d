//! Log output for the loader and the binaries embedding it.
use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};

/// Crates that get more verbose than `INFO` at the `debug` and `trace` levels.
const OWN_CRATES: &[&str] = &["taskloader_service", "taskloader_stress"];

/// The `RUST_LOG` filter for a configured level.
fn default_filter(level: LevelFilter) -> String {
    let name = level.to_string().to_uppercase();
    match level {
        LevelFilter::OFF => String::new(),
        LevelFilter::DEBUG | LevelFilter::TRACE => OWN_CRATES
            .iter()
            .fold("INFO".to_owned(), |filter, krate| {
                format!("{filter},{krate}={name}")
            }),
        _ => name,
    }
}

/// Logs JSON lines to `make_writer`, and forwards events to sentry.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}

/// Installs the global subscriber as configured in [`Logging`](crate::config::Logging).
///
/// `RUST_LOG` takes precedence over the configured level. With `format: auto`, logs are pretty
/// printed when a user is attached to the terminal, and compact otherwise. Errors are reported
/// to sentry as events, warnings and infos as sentry logs.
///
/// # Safety
/// This function uses [`std::env::set_var`] to enable backtraces, which is only safe in a
/// single-threaded context.
pub unsafe fn init_logging(config: &Config) {
    let logging = &config.logging;
    if logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter = env::var("RUST_LOG").unwrap_or_else(|_| default_filter(logging.level));

    let pretty = match logging.format {
        LogFormat::Json => return init_json_logging(&filter, std::io::stdout),
        LogFormat::Auto => console::user_attended(),
        LogFormat::Pretty => true,
        LogFormat::Simplified => false,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let fmt_layer = if pretty {
        layer.pretty().boxed()
    } else {
        layer.compact().with_ansi(false).boxed()
    };

    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event | EventFilter::Log,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Log,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(&filter)))
        .with(sentry_layer)
        .init();
}

/// Logs a fatal error, falling back to `stderr` when logging is not set up.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
