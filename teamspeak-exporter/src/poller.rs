//! Poll loop keeping the server gauges current.
//!
//! ```text
//!  Authenticating ──ok──> Polling <──ok── Degraded
//!        │                   │   ──err──>    │
//!      fatal                 │               │ max_failures or auth rejection
//!        v                   v               v
//!      exit               shutdown          exit
//! ```

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::{PollingConfig, ServerConfig};
use crate::error::{ExporterError, QueryError};
use crate::metrics::ServerMetrics;
use crate::query::{Connector, QueryClient};

/// Where the poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// No session yet; the first login is pending.
    Authenticating,
    /// Session healthy, polling on the regular interval.
    Polling,
    /// Recent polls failed; retrying with backoff.
    Degraded { failures: u32 },
}

/// Everything the poll loop needs besides the connector.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub username: String,
    pub password: String,
    pub server_id: u32,
    pub interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// 0 retries forever.
    pub max_failures: u32,
}

impl PollSettings {
    pub fn from_config(server: &ServerConfig, polling: &PollingConfig) -> Self {
        Self {
            username: server.username.clone(),
            password: server.password.clone(),
            server_id: server.server_id,
            interval: polling.interval(),
            backoff_initial: polling.backoff_initial(),
            backoff_max: polling.backoff_max(),
            max_failures: polling.max_failures,
        }
    }
}

/// Polls one virtual server and writes the results into [`ServerMetrics`].
pub struct Poller<C: Connector> {
    connector: C,
    client: Option<C::Client>,
    metrics: ServerMetrics,
    settings: PollSettings,
    backoff: Backoff,
    state: PollerState,
    failures: u32,
}

impl<C: Connector> Poller<C> {
    pub fn new(connector: C, metrics: ServerMetrics, settings: PollSettings) -> Self {
        let backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
        Self {
            connector,
            client: None,
            metrics,
            settings,
            backoff,
            state: PollerState::Authenticating,
            failures: 0,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Connect, log in and select the configured virtual server.
    async fn establish(connector: &C, settings: &PollSettings) -> Result<C::Client, QueryError> {
        let mut client = connector.connect().await?;
        client.login(&settings.username, &settings.password).await?;
        client.use_server(settings.server_id).await?;
        Ok(client)
    }

    /// Open the first session. Any failure here is fatal.
    pub async fn authenticate(&mut self) -> Result<(), ExporterError> {
        match Self::establish(&self.connector, &self.settings).await {
            Ok(client) => {
                info!(
                    username = %self.settings.username,
                    server_id = self.settings.server_id,
                    "Authenticated with ServerQuery"
                );
                self.client = Some(client);
                self.state = PollerState::Polling;
                Ok(())
            }
            Err(e) => {
                if e.is_auth() {
                    error!(
                        username = %self.settings.username,
                        error = %e,
                        "ServerQuery rejected the credentials"
                    );
                } else {
                    error!(error = %e, "Could not open ServerQuery session");
                }
                Err(ExporterError::session(e))
            }
        }
    }

    /// Run one poll cycle.
    ///
    /// Both queries must succeed before any gauge is touched. On error the
    /// session is dropped and the next cycle reconnects.
    pub async fn poll_once(&mut self) -> Result<(), QueryError> {
        let mut client = match self.client.take() {
            Some(client) => client,
            None => {
                debug!("Reconnecting to ServerQuery");
                Self::establish(&self.connector, &self.settings).await?
            }
        };

        let server = client.server_info().await?;
        let connection = client.connection_info().await?;

        self.metrics.record(&server, &connection);
        self.client = Some(client);

        debug!(
            clients = server.clients_connected(),
            uptime = server.uptime,
            bytes_sent = connection.bytes_sent_total,
            bytes_received = connection.bytes_received_total,
            "Poll complete"
        );
        Ok(())
    }

    /// Book-keeping after a cycle. Returns how long to wait before the next one.
    fn after_poll(&mut self, result: Result<(), QueryError>) -> Result<Duration, ExporterError> {
        match result {
            Ok(()) => {
                if let PollerState::Degraded { failures } = self.state {
                    info!(failures, "Polling recovered");
                }
                self.failures = 0;
                self.backoff.reset();
                self.state = PollerState::Polling;
                Ok(self.settings.interval)
            }
            Err(e) => {
                self.failures += 1;
                self.metrics.record_failure(self.failures);

                if e.is_auth() {
                    error!(error = %e, "ServerQuery rejected the credentials on reconnect");
                    return Err(ExporterError::Authentication(e));
                }

                if self.settings.max_failures > 0 && self.failures >= self.settings.max_failures {
                    error!(failures = self.failures, error = %e, "Giving up on polling");
                    return Err(ExporterError::PollFailed {
                        failures: self.failures,
                        source: e,
                    });
                }

                let delay = self.backoff.next_delay();
                warn!(
                    failures = self.failures,
                    error = %e,
                    retry_in = ?delay,
                    "Poll failed"
                );
                self.state = PollerState::Degraded {
                    failures: self.failures,
                };
                Ok(delay)
            }
        }
    }

    /// Poll until shutdown or an unrecoverable error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ExporterError> {
        if self.state == PollerState::Authenticating {
            self.authenticate().await?;
        }

        info!(
            interval = ?self.settings.interval,
            max_failures = self.settings.max_failures,
            "Starting poll loop"
        );

        loop {
            let result = self.poll_once().await;
            let delay = self.after_poll(result)?;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => {
                    self.close().await;
                    info!("Poll loop stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Say goodbye to the server if a session is open.
    async fn close(&mut self) {
        if let Some(mut client) = self.client.take()
            && let Err(e) = client.quit().await
        {
            debug!(error = %e, "ServerQuery quit failed");
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::query::{ConnectionInfo, ServerInfo};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Outcome of one scripted call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Step {
        Ok,
        Fail,
        Reject,
    }

    impl Step {
        fn into_result(self) -> Result<(), QueryError> {
            match self {
                Step::Ok => Ok(()),
                Step::Fail => Err(QueryError::Closed),
                Step::Reject => Err(QueryError::from_status(
                    520,
                    "invalid loginname or password",
                )),
            }
        }
    }

    /// Shared script and call log for the stub client. Empty queues mean success.
    #[derive(Debug, Default)]
    pub struct Script {
        pub connect: VecDeque<Step>,
        pub login: VecDeque<Step>,
        pub server: VecDeque<Step>,
        pub connection: VecDeque<Step>,
        pub server_info: ServerInfo,
        pub connection_info: ConnectionInfo,
        pub connects: usize,
        pub server_calls: usize,
        pub connection_calls: usize,
        pub selected_server: Option<u32>,
        pub quits: usize,
        pub login_delay: Option<Duration>,
    }

    fn next(queue: &mut VecDeque<Step>) -> Result<(), QueryError> {
        queue.pop_front().unwrap_or(Step::Ok).into_result()
    }

    #[derive(Clone, Default)]
    pub struct StubConnector {
        pub script: Arc<Mutex<Script>>,
    }

    pub struct StubClient {
        script: Arc<Mutex<Script>>,
    }

    impl Connector for StubConnector {
        type Client = StubClient;

        async fn connect(&self) -> Result<StubClient, QueryError> {
            let mut script = self.script.lock();
            script.connects += 1;
            next(&mut script.connect)?;
            Ok(StubClient {
                script: self.script.clone(),
            })
        }
    }

    impl QueryClient for StubClient {
        async fn login(&mut self, _username: &str, _password: &str) -> Result<(), QueryError> {
            let delay = self.script.lock().login_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            next(&mut self.script.lock().login)
        }

        async fn use_server(&mut self, server_id: u32) -> Result<(), QueryError> {
            self.script.lock().selected_server = Some(server_id);
            Ok(())
        }

        async fn server_info(&mut self) -> Result<ServerInfo, QueryError> {
            let mut script = self.script.lock();
            script.server_calls += 1;
            next(&mut script.server)?;
            Ok(script.server_info.clone())
        }

        async fn connection_info(&mut self) -> Result<ConnectionInfo, QueryError> {
            let mut script = self.script.lock();
            script.connection_calls += 1;
            next(&mut script.connection)?;
            Ok(script.connection_info.clone())
        }

        async fn quit(&mut self) -> Result<(), QueryError> {
            self.script.lock().quits += 1;
            Ok(())
        }
    }

    pub fn test_server_info() -> ServerInfo {
        ServerInfo {
            clients_online: 12,
            query_clients_online: 2,
            uptime: 3600,
            max_clients: 32,
            version: "3.13.7".to_string(),
            platform: "Linux".to_string(),
            status: "online".to_string(),
            name: "Test".to_string(),
        }
    }

    pub fn test_connection_info() -> ConnectionInfo {
        ConnectionInfo {
            bytes_sent_total: 5000,
            bytes_received_total: 7000,
        }
    }

    fn settings(max_failures: u32) -> PollSettings {
        PollSettings {
            username: "serveradmin".to_string(),
            password: "secret".to_string(),
            server_id: 1,
            interval: Duration::from_millis(10),
            backoff_initial: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            max_failures,
        }
    }

    fn make_poller(
        max_failures: u32,
    ) -> (Poller<StubConnector>, Arc<Mutex<Script>>, MetricsRegistry) {
        let connector = StubConnector::default();
        {
            let mut script = connector.script.lock();
            script.server_info = test_server_info();
            script.connection_info = test_connection_info();
        }
        let script = connector.script.clone();
        let mut registry = MetricsRegistry::new("teamspeak");
        let metrics = ServerMetrics::register(&mut registry).unwrap();
        let poller = Poller::new(connector, metrics, settings(max_failures));
        (poller, script, registry)
    }

    #[tokio::test]
    async fn test_poll_updates_gauges() {
        let (mut poller, script, registry) = make_poller(1);

        poller.authenticate().await.unwrap();
        assert_eq!(poller.state(), PollerState::Polling);
        assert_eq!(script.lock().selected_server, Some(1));

        poller.poll_once().await.unwrap();

        let output = registry.render().unwrap();
        assert!(output.contains("teamspeak_clients 10\n"));
        assert!(output.contains("teamspeak_uptime 3600\n"));
        assert!(output.contains("teamspeak_max_number_of_clients 32\n"));
        assert!(output.contains("teamspeak_bytes_sent_total 5000\n"));
        assert!(output.contains("teamspeak_bytes_received_total 7000\n"));
        assert!(output.contains(
            "teamspeak_system_info{server_version=\"3.13.7\",platform=\"Linux\",status=\"online\",name=\"Test\"} 1"
        ));
    }

    #[tokio::test]
    async fn test_failed_connection_info_applies_nothing() {
        let (mut poller, script, registry) = make_poller(0);
        poller.authenticate().await.unwrap();
        poller.poll_once().await.unwrap();

        {
            let mut script = script.lock();
            script.server_info.uptime = 7200;
            script.server_info.clients_online = 30;
            script.connection_info.bytes_sent_total = 9999;
            script.connection.push_back(Step::Fail);
        }

        let result = poller.poll_once().await;
        assert!(result.is_err());

        let output = registry.render().unwrap();
        assert!(output.contains("teamspeak_bytes_sent_total 5000\n"));
        assert!(output.contains("teamspeak_bytes_received_total 7000\n"));
        assert!(output.contains("teamspeak_uptime 3600\n"));
        assert!(output.contains("teamspeak_clients 10\n"));
    }

    #[tokio::test]
    async fn test_auth_failure_prevents_polling() {
        let (mut poller, script, _registry) = make_poller(0);
        script.lock().login.push_back(Step::Reject);

        let err = poller.authenticate().await.unwrap_err();

        assert!(matches!(err, ExporterError::Authentication(_)));
        assert_eq!(poller.state(), PollerState::Authenticating);
        assert_eq!(script.lock().server_calls, 0);
    }

    #[tokio::test]
    async fn test_run_with_rejected_login_never_polls() {
        let (poller, script, _registry) = make_poller(0);
        script.lock().login.push_back(Step::Reject);
        let (_tx, rx) = watch::channel(false);

        let err = poller.run(rx).await.unwrap_err();

        assert!(matches!(err, ExporterError::Authentication(_)));
        assert_eq!(script.lock().server_calls, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_at_startup() {
        let (mut poller, script, _registry) = make_poller(0);
        script.lock().connect.push_back(Step::Fail);

        let err = poller.authenticate().await.unwrap_err();
        assert!(matches!(err, ExporterError::Startup(QueryError::Closed)));
    }

    #[tokio::test]
    async fn test_single_failure_is_fatal_with_max_one() {
        let (poller, script, _registry) = make_poller(1);
        script.lock().server.push_back(Step::Fail);
        let (_tx, rx) = watch::channel(false);

        let err = poller.run(rx).await.unwrap_err();
        assert!(matches!(err, ExporterError::PollFailed { failures: 1, .. }));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_failures() {
        let (poller, script, registry) = make_poller(3);
        {
            let mut script = script.lock();
            script.server.push_back(Step::Fail);
            // Every reconnect fails from here on
            script.connect.extend([Step::Ok, Step::Fail, Step::Fail, Step::Fail]);
        }
        let (_tx, rx) = watch::channel(false);

        let err = poller.run(rx).await.unwrap_err();

        assert!(matches!(err, ExporterError::PollFailed { failures: 3, .. }));
        let output = registry.render().unwrap();
        assert!(output.contains("teamspeak_exporter_poll_errors_total 3\n"));
        assert!(output.contains("teamspeak_exporter_up 0\n"));
    }

    #[tokio::test]
    async fn test_recovers_after_failure() {
        let (mut poller, script, registry) = make_poller(5);
        poller.authenticate().await.unwrap();
        script.lock().server.push_back(Step::Fail);

        let result = poller.poll_once().await;
        let delay = poller.after_poll(result).unwrap();
        assert_eq!(delay, Duration::from_millis(5));
        assert_eq!(poller.state(), PollerState::Degraded { failures: 1 });

        let result = poller.poll_once().await;
        let delay = poller.after_poll(result).unwrap();
        assert_eq!(delay, Duration::from_millis(10));
        assert_eq!(poller.state(), PollerState::Polling);

        // One session at startup, one after the failure
        assert_eq!(script.lock().connects, 2);
        let output = registry.render().unwrap();
        assert!(output.contains("teamspeak_exporter_up 1\n"));
        assert!(output.contains("teamspeak_exporter_consecutive_failures 0\n"));
    }

    #[tokio::test]
    async fn test_backoff_grows_while_degraded() {
        let (mut poller, script, _registry) = make_poller(0);
        poller.authenticate().await.unwrap();
        script
            .lock()
            .server
            .extend([Step::Fail, Step::Fail, Step::Fail, Step::Fail]);

        let mut delays = Vec::new();
        for _ in 0..4 {
            let result = poller.poll_once().await;
            delays.push(poller.after_poll(result).unwrap());
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(20),
            ]
        );
        assert_eq!(poller.state(), PollerState::Degraded { failures: 4 });
    }

    #[tokio::test]
    async fn test_rejected_reconnect_is_fatal() {
        let (mut poller, script, _registry) = make_poller(0);
        poller.authenticate().await.unwrap();
        {
            let mut script = script.lock();
            script.server.push_back(Step::Fail);
            script.login.push_back(Step::Reject);
        }

        let result = poller.poll_once().await;
        assert!(poller.after_poll(result).is_ok());

        let result = poller.poll_once().await;
        let err = poller.after_poll(result).unwrap_err();
        assert!(matches!(err, ExporterError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (poller, script, registry) = make_poller(0);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(poller.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();

        let script = script.lock();
        assert!(script.server_calls >= 1);
        assert_eq!(script.quits, 1);
        assert!(registry.render().unwrap().contains("teamspeak_clients 10\n"));
    }
}
