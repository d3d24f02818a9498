//! # Panoptes-Stream Status
//!
//! The process status endpoint: `GET /healthcheck` answers the
//! registry health checks, `GET /metrics` serves every collector
//! registered against the default Prometheus registry.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Errors from the status server.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// The listen address could not be bound.
    #[error("bind error: {0}")]
    Bind(std::io::Error),

    /// The server exited with an I/O error.
    #[error("serve error: {0}")]
    Serve(std::io::Error),
}

/// Serves the status endpoint until cancellation.
///
/// # Errors
///
/// [`StatusError::Bind`] when the address is unavailable,
/// [`StatusError::Serve`] when the accept loop fails.
pub async fn serve(addr: String, cancel: CancellationToken) -> Result<(), StatusError> {
    let app = router();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(StatusError::Bind)?;
    info!(addr, "status endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(StatusError::Serve)
}

fn router() -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
}

async fn healthcheck() -> &'static str {
    "panoptes alive and reachable"
}

async fn metrics() -> (StatusCode, [(header::HeaderName, String); 1], Vec<u8>) {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain".to_string())],
            e.to_string().into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthcheck_body() {
        assert_eq!(healthcheck().await, "panoptes alive and reachable");
    }

    #[tokio::test]
    async fn test_metrics_encode() {
        let (status, headers, body) = metrics().await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[0].1.starts_with("text/plain"));
        // The default registry always encodes, even when empty.
        let _ = String::from_utf8(body).unwrap();
    }

    #[tokio::test]
    async fn test_serve_binds_and_shuts_down() {
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve("127.0.0.1:0".to_string(), cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("graceful shutdown")
            .unwrap()
            .unwrap();
    }
}
