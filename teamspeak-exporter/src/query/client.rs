//! ServerQuery client over a byte stream.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::protocol::{BANNER, Line, Record, command, parse_records};
use super::{ConnectionInfo, Connector, QueryClient, ServerInfo};
use crate::error::QueryError;

/// A ServerQuery session on top of any async stream.
pub struct ServerQueryClient<S> {
    stream: BufStream<S>,
    command_timeout: Duration,
}

impl<S> ServerQueryClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a freshly opened stream and consume the server greeting.
    pub async fn handshake(stream: S, command_timeout: Duration) -> Result<Self, QueryError> {
        let mut client = Self {
            stream: BufStream::new(stream),
            command_timeout,
        };

        timeout(command_timeout, client.read_greeting())
            .await
            .map_err(|_| QueryError::Timeout {
                command: "greeting".to_string(),
                timeout: command_timeout,
            })??;

        Ok(client)
    }

    async fn read_line(&mut self) -> Result<String, QueryError> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(QueryError::Closed);
        }
        Ok(line)
    }

    /// Next line that carries content.
    async fn read_content_line(&mut self) -> Result<Line, QueryError> {
        loop {
            match Line::classify(&self.read_line().await?)? {
                Line::Empty => continue,
                line => return Ok(line),
            }
        }
    }

    async fn read_greeting(&mut self) -> Result<(), QueryError> {
        match self.read_content_line().await? {
            Line::Data(banner) if banner == BANNER => {}
            other => {
                return Err(QueryError::Protocol(format!(
                    "expected '{}' banner, got {:?}",
                    BANNER, other
                )));
            }
        }

        // Welcome text, content irrelevant
        self.read_content_line().await?;
        Ok(())
    }

    /// Send one command and collect its records, bounded by the command timeout.
    async fn execute(&mut self, line: &str) -> Result<Vec<Record>, QueryError> {
        let name = line.split(' ').next().unwrap_or(line).to_string();
        let limit = self.command_timeout;

        let outcome = timeout(limit, self.roundtrip(&name, line)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout {
                command: name,
                timeout: limit,
            }),
        }
    }

    async fn roundtrip(&mut self, name: &str, line: &str) -> Result<Vec<Record>, QueryError> {
        // Only the command name is logged, parameters may hold credentials
        trace!(command = %name, "Sending ServerQuery command");

        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;

        let mut data = Vec::new();
        loop {
            match self.read_content_line().await? {
                Line::Status { id: 0, .. } => return Ok(parse_records(&data)),
                Line::Status { id, message } => {
                    debug!(command = %name, id, message = %message, "ServerQuery command failed");
                    return Err(QueryError::from_status(id, message));
                }
                Line::Data(data_line) => data.push(data_line),
                Line::Notify | Line::Empty => {}
            }
        }
    }

    async fn execute_single(&mut self, line: &str) -> Result<Record, QueryError> {
        self.execute(line)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::Protocol(format!("empty response to '{}'", line)))
    }
}

impl<S> QueryClient for ServerQueryClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn login(&mut self, username: &str, password: &str) -> Result<(), QueryError> {
        let line = command(
            "login",
            &[
                ("client_login_name", username),
                ("client_login_password", password),
            ],
        );
        self.execute(&line).await.map(|_| ())
    }

    async fn use_server(&mut self, server_id: u32) -> Result<(), QueryError> {
        let sid = server_id.to_string();
        self.execute(&command("use", &[("sid", sid.as_str())]))
            .await
            .map(|_| ())
    }

    async fn server_info(&mut self) -> Result<ServerInfo, QueryError> {
        let record = self.execute_single("serverinfo").await?;
        ServerInfo::from_record(&record)
    }

    async fn connection_info(&mut self) -> Result<ConnectionInfo, QueryError> {
        let record = self.execute_single("serverrequestconnectioninfo").await?;
        ConnectionInfo::from_record(&record)
    }

    async fn quit(&mut self) -> Result<(), QueryError> {
        self.execute("quit").await.map(|_| ())
    }
}

/// Opens ServerQuery sessions over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    command_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            command_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Connector for TcpConnector {
    type Client = ServerQueryClient<TcpStream>;

    async fn connect(&self) -> Result<Self::Client, QueryError> {
        let stream = timeout(self.command_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| QueryError::Timeout {
                command: "connect".to_string(),
                timeout: self.command_timeout,
            })?
            .map_err(|source| QueryError::Connect {
                address: self.address.clone(),
                source,
            })?;

        debug!(address = %self.address, "Connected to ServerQuery");
        ServerQueryClient::handshake(stream, self.command_timeout).await
    }
}
