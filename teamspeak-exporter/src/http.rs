//! HTTP server for the Prometheus metrics endpoint.

use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};

use crate::error::ExporterError;
use crate::metrics::SharedRegistry;
use crate::poller::shutdown_requested;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    registry: SharedRegistry,
}

/// Create the HTTP router.
fn create_router(
    registry: SharedRegistry,
    metrics_path: &str,
    request_timeout: Duration,
) -> Router {
    let state = AppState { registry };

    let router = Router::new().route(metrics_path, get(metrics_handler));
    with_request_timeout(router, request_timeout)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Answer 408 to requests that take longer than `timeout` to serve.
fn with_request_timeout<S>(router: Router<S>, timeout: Duration) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(TimeoutLayer::new(timeout))
}

/// Handler for the metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.registry.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", OPENMETRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)).into_response()
        }
    }
}

/// HTTP server exposing the registry.
pub struct HttpServer {
    registry: SharedRegistry,
    listener: TcpListener,
    metrics_path: String,
    request_timeout: Duration,
}

impl HttpServer {
    /// Bind the listener. Binding early surfaces address errors before polling starts.
    pub async fn bind(
        registry: SharedRegistry,
        host: &str,
        port: u16,
        metrics_path: String,
        request_timeout: Duration,
    ) -> Result<Self, ExporterError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| ExporterError::Bind {
                address: format!("{}:{}", host, port),
                source,
            })?;

        Ok(Self {
            registry,
            listener,
            metrics_path,
            request_timeout,
        })
    }

    /// The address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ExporterError> {
        let router = create_router(self.registry, &self.metrics_path, self.request_timeout);

        info!(
            addr = %self.listener.local_addr().map_err(ExporterError::Http)?,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                shutdown_requested(&mut shutdown).await;
                info!("HTTP server shutting down");
            })
            .await
            .map_err(ExporterError::Http)?;

        info!("HTTP server stopped");
        Ok(())
    }
}
