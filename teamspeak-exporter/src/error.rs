//! Error types for the TeamSpeak exporter.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// ServerQuery error id returned for a rejected login.
pub const INVALID_LOGIN_ERROR_ID: u32 = 520;

/// Errors raised while talking to the ServerQuery interface.
#[derive(Debug, Error)]
pub enum QueryError {
    /// TCP connection could not be established.
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A command did not complete in time.
    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The server closed the connection.
    #[error("Connection closed by server")]
    Closed,

    /// The server sent something that is not ServerQuery.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server rejected the login credentials.
    #[error("Authentication rejected: {message}")]
    Auth { message: String },

    /// The server answered a command with a non-zero error id.
    #[error("Server error {id}: {message}")]
    Server { id: u32, message: String },

    /// A response record lacked a required field.
    #[error("Missing field '{0}' in response")]
    MissingField(&'static str),

    /// A response field could not be parsed.
    #[error("Invalid value '{value}' for field '{field}'")]
    InvalidField { field: &'static str, value: String },
}

impl QueryError {
    /// Build the error matching a ServerQuery `error id=… msg=…` line.
    pub fn from_status(id: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        if id == INVALID_LOGIN_ERROR_ID {
            Self::Auth { message }
        } else {
            Self::Server { id, message }
        }
    }

    /// Whether the error is a credential rejection rather than a transport or query failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// Errors raised by the metrics registry.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metric '{0}' is already registered")]
    Duplicate(String),
    #[error("Failed to encode metrics: {0}")]
    Encode(#[from] std::fmt::Error),
}

/// Top-level errors that terminate the exporter.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Http(#[source] std::io::Error),

    /// Connecting to the server failed before polling started.
    #[error("Failed to start query session: {0}")]
    Startup(#[source] QueryError),

    /// The server rejected the configured credentials.
    #[error("Authentication failed: {0}")]
    Authentication(#[source] QueryError),

    /// Polling failed too many times in a row.
    #[error("Polling failed {failures} times in a row, last error: {source}")]
    PollFailed {
        failures: u32,
        #[source]
        source: QueryError,
    },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    #[error("Task failed: {0}")]
    Task(String),
}

impl ExporterError {
    /// Classify a query error raised while establishing a session.
    pub fn session(err: QueryError) -> Self {
        if err.is_auth() {
            Self::Authentication(err)
        } else {
            Self::Startup(err)
        }
    }
}

/// Result type alias using [`ExporterError`].
pub type Result<T> = std::result::Result<T, ExporterError>;
