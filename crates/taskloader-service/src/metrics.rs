//! Statsd metrics, emitted through the [`metric!`](crate::metric) macro.
//!
//! Until [`configure_statsd`] is called, all metrics are discarded.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// Traits the [`metric!`](crate::metric) macro needs in scope.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that attaches a fixed set of tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    default_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    /// Adds the default tags and sends `metric`.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.default_tags
            .iter()
            .fold(metric, |metric, (tag, value)| metric.with_tag(tag, value))
            .send()
    }
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &Self::Target {
        &self.statsd
    }
}

/// Reports all metrics to the statsd server at `host`, with names prefixed by `prefix`.
///
/// Only the first call has an effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    default_tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("Reporting metrics to statsd at {}", addr);
    }

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;

    let client = MetricsClient {
        statsd: StatsdClient::from_sink(prefix, sink),
        default_tags,
    };
    if METRICS_CLIENT.set(client).is_err() {
        tracing::warn!("statsd was already configured");
    }
    Ok(())
}

/// Calls `f` with the configured client, or returns the default of `R` if there is none.
///
/// Prefer the [`metric!`](crate::metric) macro.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    METRICS_CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("loader.submit") += 1);
/// metric!(gauge("loader.tasks.ongoing") = 3, "pool" => "worker");
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.histogram_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}
