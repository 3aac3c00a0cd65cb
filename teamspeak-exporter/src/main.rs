//! Prometheus exporter for TeamSpeak 3 servers.

use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use teamspeak_exporter::{Exporter, ExporterConfig, LogFormat, init_tracing};

/// Export TeamSpeak 3 server statistics as Prometheus metrics.
#[derive(Parser, Debug)]
#[command(name = "teamspeak-exporter")]
#[command(about = "Export TeamSpeak 3 server statistics as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// Address the metrics endpoint listens on.
    #[arg(long)]
    listen_address: Option<String>,

    /// Port the metrics endpoint listens on.
    #[arg(long)]
    listen_port: Option<u16>,

    /// ServerQuery address of the TeamSpeak server (host:port).
    #[arg(long)]
    address: Option<String>,

    /// ServerQuery login name.
    #[arg(short, long)]
    username: Option<String>,

    /// ServerQuery password.
    #[arg(short, long)]
    password: Option<String>,

    /// Virtual server ID to select after login.
    #[arg(long)]
    server_id: Option<u32>,

    /// Seconds between polls.
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Consecutive poll failures before exiting (0 retries forever).
    #[arg(long)]
    max_failures: Option<u32>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Log format.
    #[arg(long, value_parser = ["text", "json"])]
    log_format: Option<String>,
}

impl Args {
    fn apply(self, config: &mut ExporterConfig) {
        if let Some(listen_address) = self.listen_address {
            config.listen_address = listen_address;
        }
        if let Some(listen_port) = self.listen_port {
            config.listen_port = listen_port;
        }
        if let Some(address) = self.address {
            config.server.address = address;
        }
        if let Some(username) = self.username {
            config.server.username = username;
        }
        if let Some(password) = self.password {
            config.server.password = password;
        }
        if let Some(server_id) = self.server_id {
            config.server.server_id = server_id;
        }
        if let Some(interval) = self.poll_interval {
            config.polling.interval_secs = interval;
        }
        if let Some(max_failures) = self.max_failures {
            config.polling.max_failures = max_failures;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        match self.log_format.as_deref() {
            Some("json") => config.logging.format = LogFormat::Json,
            Some("text") => config.logging.format = LogFormat::Text,
            _ => {}
        }
    }
}

fn load_config(args: Args) -> anyhow::Result<ExporterConfig> {
    let mut config = match &args.config {
        Some(path) => ExporterConfig::load_from_file(path)?,
        None => ExporterConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

async fn run(config: ExporterConfig) -> anyhow::Result<()> {
    info!(
        listen = %config.listen_addr(),
        server = %config.server.address,
        server_id = config.server.server_id,
        "Starting TeamSpeak exporter"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let exporter = Exporter::start(&config, shutdown_rx).await?;
    exporter.run().await?;

    info!("Exporter stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
