//! User-facing metrics logger backed by an optional statsd sink.
//!
//! Until a `statsd` module is activated every call is a no-op.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::error::ModuleError;

const DEFAULT_STATSD_HOST: &str = "127.0.0.1";
const DEFAULT_STATSD_PORT: u16 = 8125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Timing,
    Histogram,
    Set,
}

impl MetricKind {
    fn statsd_type(&self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Gauge => "g",
            MetricKind::Timing => "ms",
            MetricKind::Histogram => "h",
            MetricKind::Set => "s",
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "counter" | "increment" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            "timing" => Ok(MetricKind::Timing),
            "histogram" => Ok(MetricKind::Histogram),
            "set" => Ok(MetricKind::Set),
            _ => Err(format!("unknown metric kind: {s}")),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Timing => "timing",
            MetricKind::Histogram => "histogram",
            MetricKind::Set => "set",
        };
        f.write_str(name)
    }
}

/// `client` section of a statsd module config. Unknown keys (e.g. `socketTimeout`) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatsdClientConfig {
    #[serde(default = "default_statsd_host")]
    pub host: String,
    #[serde(default = "default_statsd_port")]
    pub port: u16,
}

fn default_statsd_host() -> String {
    DEFAULT_STATSD_HOST.to_owned()
}

fn default_statsd_port() -> u16 {
    DEFAULT_STATSD_PORT
}

impl Default for StatsdClientConfig {
    fn default() -> Self {
        Self {
            host: default_statsd_host(),
            port: default_statsd_port(),
        }
    }
}

/// Fire-and-forget UDP statsd emitter.
#[derive(Debug)]
pub struct StatsdSink {
    socket: UdpSocket,
    target: SocketAddr,
    prefix: Option<String>,
}

impl StatsdSink {
    pub async fn connect(
        client: &StatsdClientConfig,
        prefix: Option<String>,
    ) -> Result<Self, ModuleError> {
        let target_name = format!("{}:{}", client.host, client.port);
        let socket_error = |reason: String| ModuleError::StatsdSocket {
            target: target_name.clone(),
            reason,
        };

        let target = tokio::net::lookup_host((client.host.as_str(), client.port))
            .await
            .map_err(|e| socket_error(e.to_string()))?
            .next()
            .ok_or_else(|| socket_error("host did not resolve".to_owned()))?;
        let bind = if target.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| socket_error(e.to_string()))?;

        Ok(Self {
            socket,
            target,
            prefix: prefix.filter(|p| !p.is_empty()),
        })
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn format_line(&self, kind: MetricKind, name: &str, value: f64) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{name}:{value}|{}", kind.statsd_type()),
            None => format!("{name}:{value}|{}", kind.statsd_type()),
        }
    }

    pub async fn send(&self, kind: MetricKind, name: &str, value: f64) -> std::io::Result<()> {
        let line = self.format_line(kind, name, value);
        self.socket.send_to(line.as_bytes(), self.target).await?;
        Ok(())
    }
}

/// Shared handle to the metrics logger. Cheap to clone.
#[derive(Clone, Default)]
pub struct MetricsLogger {
    sink: Arc<RwLock<Option<Arc<StatsdSink>>>>,
}

impl MetricsLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Install (or replace) the statsd sink.
    pub fn install(&self, sink: StatsdSink) {
        info!(addr = %sink.target, prefix = ?sink.prefix, "statsd metrics enabled");
        *self.sink.write() = Some(Arc::new(sink));
    }

    /// Send one metric. Never fails: without a sink this does nothing, and send errors are
    /// only logged.
    pub async fn log(&self, kind: MetricKind, name: &str, value: f64) {
        let Some(sink) = self.sink.read().clone() else {
            return;
        };
        if let Err(error) = sink.send(kind, name, value).await {
            debug!(%error, metric = name, %kind, "failed to send statsd metric");
        }
    }
}
