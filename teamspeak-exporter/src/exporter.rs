//! Wires configuration, metrics, the HTTP endpoint and the poll loop together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use crate::config::ExporterConfig;
use crate::error::{ExporterError, Result};
use crate::http::HttpServer;
use crate::metrics::{MetricsRegistry, ServerMetrics};
use crate::poller::{PollSettings, Poller};
use crate::query::{Connector, TcpConnector};

/// How long the remaining task gets to finish once the other one stopped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// An authenticated exporter whose HTTP endpoint is already serving.
pub struct Exporter<C: Connector> {
    local_addr: SocketAddr,
    http_task: JoinHandle<Result<()>>,
    poller: Poller<C>,
    shutdown: watch::Receiver<bool>,
}

impl Exporter<TcpConnector> {
    /// Start serving scrapes and log in to the configured server over TCP.
    pub async fn start(config: &ExporterConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let connector = TcpConnector::new(
            config.server.address.clone(),
            config.polling.command_timeout(),
        );
        info!(address = %connector.address(), "Using ServerQuery endpoint");
        Self::start_with(config, connector, shutdown).await
    }
}

impl<C: Connector> Exporter<C> {
    /// Start serving scrapes, then authenticate through `connector`.
    ///
    /// Scrapes are answered with zero values while the login is in flight.
    /// If the login fails the HTTP task is stopped and the poll loop never starts.
    pub async fn start_with(
        config: &ExporterConfig,
        connector: C,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let mut registry = MetricsRegistry::new(&config.metrics.prefix);
        let metrics = ServerMetrics::register(&mut registry)?;
        let registry = Arc::new(registry);

        let http = HttpServer::bind(
            registry,
            &config.listen_address,
            config.listen_port,
            config.metrics.path.clone(),
            config.metrics.request_timeout(),
        )
        .await?;
        let local_addr = http.local_addr().map_err(ExporterError::Http)?;
        let http_task = tokio::spawn(http.run(shutdown.clone()));

        let settings = PollSettings::from_config(&config.server, &config.polling);
        let mut poller = Poller::new(connector, metrics, settings);
        if let Err(e) = poller.authenticate().await {
            http_task.abort();
            return Err(e);
        }

        Ok(Self {
            local_addr,
            http_task,
            poller,
            shutdown,
        })
    }

    /// Address of the HTTP endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Poll until shutdown or the first fatal error of either task.
    pub async fn run(self) -> Result<()> {
        let mut http_task = self.http_task;
        let mut poll_task = tokio::spawn(self.poller.run(self.shutdown));

        let (first, remaining) = tokio::select! {
            result = &mut http_task => (flatten("HTTP server", result), poll_task),
            result = &mut poll_task => (flatten("poll loop", result), http_task),
        };

        if let Err(e) = first {
            remaining.abort();
            return Err(e);
        }

        wait_remaining(remaining).await
    }
}

async fn wait_remaining(task: JoinHandle<Result<()>>) -> Result<()> {
    match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
        Ok(result) => flatten("task", result),
        Err(_) => {
            warn!("Timed out waiting for tasks to stop");
            Ok(())
        }
    }
}

fn flatten(name: &str, result: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ExporterError::Task(format!("{} panicked: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::tests::{Step, StubConnector, test_connection_info, test_server_info};

    fn test_config() -> ExporterConfig {
        let mut config = ExporterConfig {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            ..Default::default()
        };
        config.polling.max_failures = 1;
        config
    }

    fn stub() -> StubConnector {
        let connector = StubConnector::default();
        {
            let mut script = connector.script.lock();
            script.server_info = test_server_info();
            script.connection_info = test_connection_info();
        }
        connector
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_start_rejected_login() {
        let connector = stub();
        connector.script.lock().login.push_back(Step::Reject);
        let (_tx, rx) = watch::channel(false);

        let result = Exporter::start_with(&test_config(), connector.clone(), rx).await;

        assert!(matches!(result, Err(ExporterError::Authentication(_))));
        assert_eq!(connector.script.lock().server_calls, 0);
    }

    #[tokio::test]
    async fn test_rejected_login_stops_http() {
        let connector = stub();
        connector.script.lock().login.push_back(Step::Reject);
        let mut config = test_config();
        config.listen_port = unused_port();
        let (_tx, rx) = watch::channel(false);

        let result = Exporter::start_with(&config, connector, rx).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let connect = tokio::net::TcpStream::connect(("127.0.0.1", config.listen_port)).await;
        assert!(connect.is_err());
    }

    #[tokio::test]
    async fn test_scrape_served_during_login() {
        let connector = stub();
        connector.script.lock().login_delay = Some(Duration::from_secs(2));
        let mut config = test_config();
        config.listen_port = unused_port();
        let port = config.listen_port;
        let (_tx, rx) = watch::channel(false);

        let starting =
            tokio::spawn(async move { Exporter::start_with(&config, connector, rx).await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let response = client
            .get(format!("http://127.0.0.1:{}/metrics", port))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body = response.text().await.unwrap();
        assert!(body.contains("teamspeak_clients 0\n"));
        assert!(body.contains("teamspeak_exporter_up 0\n"));
        assert!(!starting.is_finished());

        let exporter = starting.await.unwrap().unwrap();
        assert_eq!(exporter.local_addr().port(), port);
    }

    #[tokio::test]
    async fn test_start_selects_configured_server() {
        let connector = stub();
        let mut config = test_config();
        config.server.server_id = 4;
        let (_tx, rx) = watch::channel(false);

        let exporter = Exporter::start_with(&config, connector.clone(), rx)
            .await
            .unwrap();

        assert!(exporter.local_addr().port() > 0);
        assert_eq!(connector.script.lock().selected_server, Some(4));
    }

    #[tokio::test]
    async fn test_run_ends_on_poll_failure() {
        let connector = stub();
        connector.script.lock().connection.push_back(Step::Fail);
        let (_tx, rx) = watch::channel(false);

        let exporter = Exporter::start_with(&test_config(), connector, rx)
            .await
            .unwrap();

        let result = exporter.run().await;
        assert!(matches!(
            result,
            Err(ExporterError::PollFailed { failures: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let connector = stub();
        let (tx, rx) = watch::channel(false);
        let exporter = Exporter::start_with(&test_config(), connector.clone(), rx)
            .await
            .unwrap();

        let handle = tokio::spawn(exporter.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(connector.script.lock().quits, 1);
    }
}
