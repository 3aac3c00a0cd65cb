//! Prometheus exporter for TeamSpeak 3 servers.
//!
//! The exporter logs in to a TeamSpeak 3 server over the ServerQuery text
//! protocol, polls server and connection statistics on a fixed interval and
//! exposes them as gauges on an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   TeamSpeak 3   │────>│     Poller      │────>│   HTTP Server   │
//! │  (ServerQuery)  │     │ (gauge updates) │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! teamspeak-exporter --address ts.example.com:10011 -u serveradmin -p secret
//! teamspeak-exporter --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod backoff;
pub mod config;
pub mod error;
pub mod exporter;
pub mod http;
pub mod metrics;
pub mod poller;
pub mod query;

pub use config::{ExporterConfig, LogFormat, LoggingConfig};
pub use error::{ExporterError, QueryError, Result};
pub use exporter::Exporter;
pub use http::HttpServer;
pub use metrics::{MetricsRegistry, ServerMetrics};
pub use poller::{PollSettings, Poller, PollerState};
pub use query::{ConnectionInfo, Connector, QueryClient, ServerInfo, TcpConnector};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level: tracing::Level = config
        .level
        .parse()
        .map_err(|_| ExporterError::Logging(format!("invalid log level '{}'", config.level)))?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| ExporterError::Logging(e.to_string()))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| ExporterError::Logging(e.to_string()))?;
        }
    }

    Ok(())
}
