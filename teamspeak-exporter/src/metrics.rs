//! Metric registry and the TeamSpeak gauge set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Metric, Registry};
use tracing::debug;

use crate::error::MetricsError;
use crate::query::{ConnectionInfo, ServerInfo};

/// Registry of exposed metrics, all names sharing one prefix.
#[derive(Debug)]
pub struct MetricsRegistry {
    registry: Registry,
    names: HashSet<String>,
}

impl MetricsRegistry {
    pub fn new(prefix: &str) -> Self {
        Self {
            registry: Registry::with_prefix(prefix),
            names: HashSet::new(),
        }
    }

    /// Add a metric to the exposed set. Names must be unique.
    pub fn register(
        &mut self,
        name: &str,
        help: &str,
        metric: impl Metric,
    ) -> Result<(), MetricsError> {
        if !self.names.insert(name.to_string()) {
            return Err(MetricsError::Duplicate(name.to_string()));
        }
        self.registry.register(name, help, metric);
        Ok(())
    }

    /// Render all metrics in OpenMetrics text format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// Shareable registry handle.
pub type SharedRegistry = Arc<MetricsRegistry>;

/// Labels carried by the `system_info` series.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SystemInfoLabels {
    pub server_version: String,
    pub platform: String,
    pub status: String,
    pub name: String,
}

impl From<&ServerInfo> for SystemInfoLabels {
    fn from(info: &ServerInfo) -> Self {
        Self {
            server_version: info.version.clone(),
            platform: info.platform.clone(),
            status: info.status.clone(),
            name: info.name.clone(),
        }
    }
}

/// Gauges describing one virtual server plus the exporter's own health.
///
/// Written only by the poll loop. Clones share the underlying atomics, so
/// the registry reads the same values the poller writes.
#[derive(Debug, Clone, Default)]
pub struct ServerMetrics {
    clients: Gauge,
    uptime: Gauge,
    max_clients: Gauge,
    bytes_sent_total: Gauge,
    bytes_received_total: Gauge,
    system_info: Family<SystemInfoLabels, Gauge>,
    current_info: Arc<Mutex<Option<SystemInfoLabels>>>,

    up: Gauge,
    last_success: Gauge,
    last_error: Gauge,
    poll_errors: Counter,
    consecutive_failures: Gauge,
}

impl ServerMetrics {
    /// Create the gauge set and register every instrument.
    pub fn register(registry: &mut MetricsRegistry) -> Result<Self, MetricsError> {
        let metrics = Self::default();

        registry.register(
            "clients",
            "Number of connected clients",
            metrics.clients.clone(),
        )?;
        registry.register("uptime", "Uptime in seconds", metrics.uptime.clone())?;
        registry.register(
            "max_number_of_clients",
            "Maximum number of clients the server is able to handle",
            metrics.max_clients.clone(),
        )?;
        registry.register(
            "bytes_sent_total",
            "Total number of bytes sent",
            metrics.bytes_sent_total.clone(),
        )?;
        registry.register(
            "bytes_received_total",
            "Total number of bytes received",
            metrics.bytes_received_total.clone(),
        )?;
        registry.register(
            "system_info",
            "Information about server version",
            metrics.system_info.clone(),
        )?;

        registry.register(
            "exporter_up",
            "Whether the last poll of the server succeeded",
            metrics.up.clone(),
        )?;
        registry.register(
            "exporter_last_success_timestamp_seconds",
            "Unix time of the last successful poll",
            metrics.last_success.clone(),
        )?;
        registry.register(
            "exporter_last_error_timestamp_seconds",
            "Unix time of the last failed poll",
            metrics.last_error.clone(),
        )?;
        registry.register(
            "exporter_poll_errors",
            "Failed polls since start",
            metrics.poll_errors.clone(),
        )?;
        registry.register(
            "exporter_consecutive_failures",
            "Failed polls since the last success",
            metrics.consecutive_failures.clone(),
        )?;

        Ok(metrics)
    }

    /// Apply the results of one successful poll.
    pub fn record(&self, server: &ServerInfo, connection: &ConnectionInfo) {
        self.clients.set(to_gauge(server.clients_connected()));
        self.uptime.set(to_gauge(server.uptime));
        self.max_clients.set(to_gauge(server.max_clients));
        self.bytes_sent_total
            .set(to_gauge(connection.bytes_sent_total));
        self.bytes_received_total
            .set(to_gauge(connection.bytes_received_total));
        self.set_system_info(SystemInfoLabels::from(server));

        self.up.set(1);
        self.last_success.set(unix_now());
        self.consecutive_failures.set(0);
    }

    /// Mark a failed poll. Server gauges keep their last values.
    pub fn record_failure(&self, consecutive: u32) {
        self.up.set(0);
        self.last_error.set(unix_now());
        self.poll_errors.inc();
        self.consecutive_failures.set(i64::from(consecutive));
    }

    /// Keep exactly one `system_info` series: the latest label set.
    fn set_system_info(&self, labels: SystemInfoLabels) {
        let mut current = self.current_info.lock();

        self.system_info.get_or_create(&labels).set(1);

        if let Some(previous) = current.as_ref()
            && *previous != labels
        {
            debug!(
                old_version = %previous.server_version,
                new_version = %labels.server_version,
                "Server info labels changed"
            );
            self.system_info.remove(previous);
        }

        *current = Some(labels);
    }
}

/// Server counters are unsigned; saturate instead of wrapping.
fn to_gauge(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| to_gauge(d.as_secs()))
        .unwrap_or_default()
}
