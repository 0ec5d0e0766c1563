pub mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use self::metrics::encode_registry;

/// HTTP server exposing `/metrics` and `/healthz`.
pub struct MetricsServer {
    registry: Registry,
    addr: String,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl MetricsServer {
    /// Creates a server for `registry` listening on `addr` once started.
    pub fn new(registry: Registry, addr: &str) -> Self {
        Self {
            registry,
            addr: addr.to_string(),
            local_addr: parking_lot::Mutex::new(None),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and serves in a background task.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(())
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the `:port` shorthand to all interfaces.
fn bind_address(addr: &str) -> String {
    let addr = if addr.is_empty() { ":8080" } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_port_shorthand() {
        assert_eq!(bind_address(":8080"), "0.0.0.0:8080");
        assert_eq!(bind_address(""), "0.0.0.0:8080");
        assert_eq!(bind_address("127.0.0.1:9100"), "127.0.0.1:9100");
    }

    #[tokio::test]
    async fn test_serves_metrics_and_healthz() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let registry = Registry::new();
        let counter = prometheus::IntCounter::new("test_requests_total", "test").expect("counter");
        registry.register(Box::new(counter.clone())).expect("register");
        counter.inc_by(7);

        let server = MetricsServer::new(registry, "127.0.0.1:0");
        server.start().await.expect("start");
        let addr = server.local_addr().expect("bound");

        for (path, expected) in [("/metrics", "test_requests_total 7"), ("/healthz", "ok")] {
            let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
            let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
            stream.write_all(request.as_bytes()).await.expect("write");

            let mut response = String::new();
            stream.read_to_string(&mut response).await.expect("read");
            assert!(response.starts_with("HTTP/1.1 200"), "{path}: {response}");
            assert!(response.contains(expected), "{path}: {response}");
        }

        server.stop().await.expect("stop");
    }
}
