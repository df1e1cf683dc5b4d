use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io;
use std::net::UdpSocket;
use std::pin::Pin;

use anyhow::Result;
use taskloader_service::config::{Config, Metrics};
use taskloader_service::{logging, metrics};

/// Background work and guards that have to outlive the stresstest.
#[derive(Default)]
pub struct Guard {
    /// Receives and discards the statsd packets when no statsd server is configured.
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    /// Flushes pending sentry events when dropped.
    pub sentry: Option<sentry::ClientInitGuard>,
}

/// Sets up sentry, logging and metrics as configured.
///
/// Unless `verbose` is set, log lines are formatted but discarded, and metrics without a
/// configured statsd server go to a local socket that drops them.
///
/// # Safety
/// This function uses [`std::env::set_var`] and must be called in a single-threaded context.
pub unsafe fn init(config: &Config, verbose: bool) -> Result<Guard> {
    let mut guard = Guard::default();

    if config.sentry_dsn.is_some() {
        guard.sentry = Some(sentry::init(sentry::ClientOptions {
            dsn: config.sentry_dsn.clone(),
            release: sentry::release_name!(),
            ..Default::default()
        }));
    }

    if verbose {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { logging::init_logging(config) };
    } else {
        if config.logging.enable_backtraces {
            // SAFETY: As documented, this function may only be called in a single-threaded context.
            unsafe { env::set_var("RUST_BACKTRACE", "1") };
        }
        logging::init_json_logging(&config.logging.level.to_string(), || NoopWriter);
    }

    let tags = statsd_tags(&config.metrics);
    let prefix = &config.metrics.prefix;
    match &config.metrics.statsd {
        Some(statsd) => metrics::configure_statsd(prefix, statsd.as_str(), tags)?,
        None => {
            let socket = UdpSocket::bind(("127.0.0.1", 0))?;
            socket.set_nonblocking(true)?;
            let addr = socket.local_addr()?;
            guard.udp_sink = Some(Box::pin(drain_udp(socket)));
            metrics::configure_statsd(prefix, addr, tags)?;
        }
    }

    Ok(guard)
}

/// The configured custom tags, on top of tags marking the metrics as stresstest traffic.
fn statsd_tags(metrics: &Metrics) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::from([
        ("host".to_owned(), "stresstest".to_owned()),
        ("env".to_owned(), "stresstest".to_owned()),
    ]);
    tags.extend(metrics.custom_tags.clone());
    tags
}

async fn drain_udp(socket: UdpSocket) {
    let Ok(socket) = tokio::net::UdpSocket::from_std(socket) else {
        return;
    };
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        if socket.recv_buf(&mut buf).await.is_err() {
            break;
        }
    }
}

/// Formats everything but writes nothing.
struct NoopWriter;

impl io::Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // keeps the formatting from being optimized away
        Ok(std::hint::black_box(buf).len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
