// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The diagnostics HTTP server, which exposes metrics for Prometheus at `/metrics`.

use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::observability::Metrics;

async fn metrics_handler(State(metrics): State<Metrics>) -> Response {
    match metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => {
            tracing::error!(?error, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {error}"),
            )
                .into_response()
        }
    }
}

/// A running diagnostics server.
pub struct DebugServer {
    local_addr: SocketAddr,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl DebugServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the server to exit, which happens once the halt token is cancelled.
    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await?
    }
}

/// Serve metrics on `address` until `halt_token` is cancelled.
///
/// Returns once the listener is bound.
#[tracing::instrument(skip_all, err, fields(address = %address))]
pub async fn listen(
    address: &str,
    metrics: Metrics,
    halt_token: CancellationToken,
) -> anyhow::Result<DebugServer> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind the debug server to {address}"))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "Debug server listening");

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let task = tokio::spawn(
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { halt_token.cancelled().await })
                .await
                .context("debug server failed")
        }
        .instrument(tracing::Span::current()),
    );

    Ok(DebugServer { local_addr, task })
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn serves_metrics() -> anyhow::Result<()> {
        let metrics = Metrics::new()?;
        metrics.rpc_connections.inc();
        let halt_token = CancellationToken::new();
        let server = listen("127.0.0.1:0", metrics, halt_token.clone()).await?;

        let mut stream = tokio::net::TcpStream::connect(server.local_addr()).await?;
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("ct_publisher_rpc_connections_total 1"));

        halt_token.cancel();
        server.wait_to_finish().await?;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_path() -> anyhow::Result<()> {
        let halt_token = CancellationToken::new();
        let server = listen("127.0.0.1:0", Metrics::new()?, halt_token.clone()).await?;

        let mut stream = tokio::net::TcpStream::connect(server.local_addr()).await?;
        stream
            .write_all(b"GET /debug/pprof HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        assert!(response.starts_with("HTTP/1.1 404"));

        halt_token.cancel();
        server.wait_to_finish().await?;
        Ok(())
    }
}
