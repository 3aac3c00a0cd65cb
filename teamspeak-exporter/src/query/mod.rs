//! TeamSpeak ServerQuery access.
//!
//! The poll loop only sees the [`QueryClient`] and [`Connector`] traits, so the
//! TCP client in [`client`] can be swapped for a scripted stub in tests.

pub mod client;
pub mod protocol;

use std::future::Future;

use crate::error::QueryError;
use protocol::Record;

pub use client::{ServerQueryClient, TcpConnector};

/// Subset of `serverinfo` the exporter publishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub clients_online: u64,
    pub query_clients_online: u64,
    pub uptime: u64,
    pub max_clients: u64,
    pub version: String,
    pub platform: String,
    pub status: String,
    pub name: String,
}

impl ServerInfo {
    /// Clients visible to users, excluding query connections such as this exporter's own.
    pub fn clients_connected(&self) -> u64 {
        self.clients_online.saturating_sub(self.query_clients_online)
    }

    pub fn from_record(record: &Record) -> Result<Self, QueryError> {
        Ok(Self {
            clients_online: record.parse("virtualserver_clientsonline")?,
            query_clients_online: record.parse("virtualserver_queryclientsonline")?,
            uptime: record.parse("virtualserver_uptime")?,
            max_clients: record.parse("virtualserver_maxclients")?,
            version: record.text("virtualserver_version")?.to_string(),
            platform: record.text("virtualserver_platform")?.to_string(),
            status: record.text("virtualserver_status")?.to_string(),
            name: record.text("virtualserver_name")?.to_string(),
        })
    }
}

/// Subset of `serverrequestconnectioninfo` the exporter publishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub bytes_sent_total: u64,
    pub bytes_received_total: u64,
}

impl ConnectionInfo {
    pub fn from_record(record: &Record) -> Result<Self, QueryError> {
        Ok(Self {
            bytes_sent_total: record.parse("connection_bytes_sent_total")?,
            bytes_received_total: record.parse("connection_bytes_received_total")?,
        })
    }
}

/// An authenticated-or-not ServerQuery session.
pub trait QueryClient: Send {
    /// Authenticate the session.
    fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<(), QueryError>> + Send;

    /// Select the virtual server subsequent commands apply to.
    fn use_server(&mut self, server_id: u32) -> impl Future<Output = Result<(), QueryError>> + Send;

    fn server_info(&mut self) -> impl Future<Output = Result<ServerInfo, QueryError>> + Send;

    fn connection_info(&mut self)
    -> impl Future<Output = Result<ConnectionInfo, QueryError>> + Send;

    /// Close the session politely.
    fn quit(&mut self) -> impl Future<Output = Result<(), QueryError>> + Send;
}

/// Opens new [`QueryClient`] sessions.
pub trait Connector: Send + Sync + 'static {
    type Client: QueryClient + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Client, QueryError>> + Send;
}
