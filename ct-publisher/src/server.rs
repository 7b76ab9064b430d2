// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The mutual TLS RPC server.
//!
//! Services are registered with a [`ServerBuilder`] and addressed by name. Each accepted
//! connection is handled in its own task; requests on a connection are handled one at a time,
//! in order. A `Health` service is always provided.

use std::{
    collections::BTreeMap,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use openssl::ssl::{Ssl, SslAcceptor};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    signal::unix::{signal, SignalKind},
};
use tokio_openssl::SslStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::{GrpcConfig, ServiceConfig},
    observability::Metrics,
    protocol::{self, Message, OuterRequest, OuterResponse, Response, ServerError},
};

/// The name of the built-in health service.
pub const HEALTH_SERVICE: &str = "Health";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A request routed to a [`Service`].
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub body: serde_json::Value,
    pub binary: Bytes,
}

/// A service's successful reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub body: serde_json::Value,
    pub binary: Option<Bytes>,
}

impl Reply {
    pub fn json<T: Serialize>(body: &T) -> Result<Self, ServerError> {
        let body = serde_json::to_value(body).map_err(|error| {
            tracing::error!(?error, "Failed to serialize a response");
            ServerError::Internal
        })?;
        Ok(Self { body, binary: None })
    }
}

pub type ServiceFuture<'a> = Pin<Box<dyn Future<Output = Result<Reply, ServerError>> + Send + 'a>>;

/// An RPC service.
pub trait Service: Send + Sync {
    /// The name clients use to address this service, and the key of its entry in the
    /// transport configuration.
    fn name(&self) -> &'static str;

    /// Handle a request, or return `None` if the service has no such method.
    fn call(&self, request: Request) -> Option<ServiceFuture<'_>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServingStatus {
    Serving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

/// Reports `Serving` for as long as the connection it is asked on stays open.
///
/// Connections close as soon as shutdown begins, so there is no draining state to report.
struct Health;

impl Service for Health {
    fn name(&self) -> &'static str {
        HEALTH_SERVICE
    }

    fn call(&self, request: Request) -> Option<ServiceFuture<'_>> {
        match request.method.as_str() {
            "Check" => Some(Box::pin(async move {
                Reply::json(&HealthCheckResponse {
                    status: ServingStatus::Serving,
                })
            })),
            _ => None,
        }
    }
}

/// Collects services before the listener is bound.
pub struct ServerBuilder {
    config: GrpcConfig,
    services: Vec<Arc<dyn Service>>,
}

impl ServerBuilder {
    pub fn new(config: GrpcConfig) -> Self {
        Self {
            config,
            services: vec![],
        }
    }

    pub fn add(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Check the registered services against the configuration and bind the listener.
    ///
    /// Every registered service must have an entry in `services`, and every entry must name a
    /// registered service. The `Health` service may be configured to restrict which clients
    /// can check it; otherwise any authenticated client can.
    #[instrument(skip_all, err, fields(address = %self.config.address))]
    pub async fn build(
        self,
        tls: SslAcceptor,
        metrics: Metrics,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Server> {
        let halt_token = CancellationToken::new();
        let mut services: BTreeMap<&'static str, Arc<dyn Service>> = BTreeMap::new();
        services.insert(HEALTH_SERVICE, Arc::new(Health));
        for service in self.services {
            let name = service.name();
            if services.insert(name, service).is_some() {
                anyhow::bail!("service {name} was registered more than once");
            }
            if !self.config.services.contains_key(name) {
                anyhow::bail!(
                    "service {name} has no entry in publisher.grpc.services; \
                    add one listing the client names allowed to call it"
                );
            }
        }
        if let Some(name) = self
            .config
            .services
            .keys()
            .find(|name| !services.contains_key(name.as_str()))
        {
            anyhow::bail!("publisher.grpc.services.{name} does not match any service");
        }

        let address = self.config.socket_addr()?;
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to listen on {address}"))?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, services = ?services.keys().collect::<Vec<_>>(), "RPC listener bound");

        let max_connection_age = self.config.max_connection_age();
        Ok(Server {
            listener,
            local_addr,
            halt_token,
            shared: Arc::new(Shared {
                acceptor: tls,
                services,
                authorization: self.config.services,
                max_connection_age,
                metrics,
                clock,
            }),
        })
    }
}

// State shared by every connection.
struct Shared {
    acceptor: SslAcceptor,
    services: BTreeMap<&'static str, Arc<dyn Service>>,
    authorization: BTreeMap<String, ServiceConfig>,
    max_connection_age: Option<Duration>,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn authorized(&self, service: &str, peer_names: &[String]) -> bool {
        match self.authorization.get(service) {
            Some(config) => peer_names
                .iter()
                .any(|name| config.client_names.contains(name)),
            None => service == HEALTH_SERVICE,
        }
    }

    async fn dispatch(&self, peer_names: &[String], message: Message) -> (OuterResponse, Option<Bytes>) {
        let request = match serde_json::from_slice::<OuterRequest>(&message.json) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(?error, "Client request is not a supported request");
                let request_id = serde_json::from_slice::<serde_json::Value>(&message.json)
                    .ok()
                    .and_then(|value| value.get("request_id").and_then(|v| v.as_u64()))
                    .unwrap_or(0);
                self.metrics
                    .rpc_requests
                    .with_label_values(&["unknown", "unknown", "unsupported"])
                    .inc();
                let response = OuterResponse {
                    request_id,
                    response: Response::Unsupported,
                };
                return (response, None);
            }
        };
        let OuterRequest {
            request_id,
            service: service_name,
            method,
            body,
        } = request;

        let Some(service) = self.services.get(service_name.as_str()) else {
            tracing::warn!(service = %service_name, "Request for an unknown service");
            self.metrics
                .rpc_requests
                .with_label_values(&["unknown", "unknown", "unsupported"])
                .inc();
            let response = OuterResponse {
                request_id,
                response: Response::Unsupported,
            };
            return (response, None);
        };
        let service_label = service.name();

        if !self.authorized(service_label, peer_names) {
            tracing::warn!(
                service = service_label,
                ?peer_names,
                "Client is not authorized to use the service"
            );
            self.metrics
                .rpc_requests
                .with_label_values(&[service_label, &method, "unauthorized"])
                .inc();
            let response = OuterResponse {
                request_id,
                response: Response::Error {
                    reason: ServerError::Unauthorized {
                        service: service_label.to_string(),
                    },
                },
            };
            return (response, None);
        }

        let started = Instant::now();
        let call = service.call(Request {
            method: method.clone(),
            body,
            binary: message.binary,
        });
        let (response, binary, status) = match call {
            None => (Response::Unsupported, None, "unsupported"),
            Some(call) => match call.await {
                Ok(reply) => (Response::Ok { body: reply.body }, reply.binary, "ok"),
                Err(reason) => {
                    tracing::info!(service = service_label, %method, %reason, "Request failed");
                    (Response::Error { reason }, None, "error")
                }
            },
        };
        // Unknown methods are client-controlled strings; keep them out of the labels.
        let method_label = if status == "unsupported" { "unknown" } else { method.as_str() };
        self.metrics
            .rpc_requests
            .with_label_values(&[service_label, method_label, status])
            .inc();
        self.metrics
            .rpc_latency
            .with_label_values(&[service_label, method_label])
            .observe(started.elapsed().as_secs_f64());

        (
            OuterResponse {
                request_id,
                response,
            },
            binary,
        )
    }
}

/// A bound RPC server, ready to start.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    halt_token: CancellationToken,
    shared: Arc<Shared>,
}

impl Server {
    /// The address the server is listening on. This is primarily useful for tests when
    /// binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a cancellation token which can be used to start the graceful shutdown of this
    /// server.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    /// Accept connections until the halt token is cancelled, then wait for open connections
    /// to finish their current request.
    #[instrument(skip_all, err, name = "server", fields(address = %self.local_addr))]
    pub async fn start(self) -> anyhow::Result<()> {
        let connection_tracker = TaskTracker::new();

        'accept: loop {
            let (tcp_stream, client_addr) = tokio::select! {
                _ = self.halt_token.cancelled() => {
                    tracing::info!("Shutdown requested, no new connections will be accepted");
                    break 'accept;
                },
                conn = self.listener.accept() => match conn {
                    Ok(conn) => conn,
                    Err(error) => {
                        tracing::warn!(?error, "Failed to accept new TCP connection");
                        continue 'accept;
                    }
                },
            };
            tracing::debug!(?client_addr, "New TCP connection established");

            let ssl = Ssl::new(self.shared.acceptor.context())?;
            connection_tracker.spawn(
                serve_connection(
                    self.shared.clone(),
                    self.halt_token.clone(),
                    ssl,
                    tcp_stream,
                    client_addr,
                )
                .instrument(tracing::Span::current()),
            );
        }

        connection_tracker.close();
        connection_tracker.wait().await;
        tracing::info!("All connections are now closed");

        Ok(())
    }
}

#[instrument(
    skip_all,
    err,
    fields(connection_id = %Uuid::now_v7(), ?client_addr, peer = tracing::field::Empty)
)]
async fn serve_connection(
    shared: Arc<Shared>,
    halt_token: CancellationToken,
    ssl: Ssl,
    tcp_stream: TcpStream,
    client_addr: SocketAddr,
) -> anyhow::Result<()> {
    let mut stream = SslStream::new(ssl, tcp_stream)?;
    tokio::time::timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut stream).accept())
        .await
        .context("TLS handshake timed out")??;
    let peer_names = protocol::peer_names(stream.ssl())?;
    tracing::Span::current().record("peer", peer_names.join(",").as_str());
    tracing::info!("TLS session established");

    shared.metrics.rpc_connections.inc();
    shared.metrics.rpc_open_connections.inc();
    let opened_at = shared.clock.now();
    let result = async {
        loop {
            // `read_message` is not cancel safe, but the connection is dropped if it's
            // cancelled so a partially read frame is never resumed.
            let message = tokio::select! {
                _ = halt_token.cancelled() => {
                    tracing::info!("Shutdown requested; closing connection");
                    break;
                },
                message = protocol::read_message(&mut stream) => message?,
            };
            let Some(message) = message else {
                tracing::info!("Connection sent empty frame indicating it is done; closing connection");
                break;
            };

            let (response, binary) = shared.dispatch(&peer_names, message).await;
            protocol::write_message(&mut stream, &response, binary.as_deref()).await?;

            if let Some(max_age) = shared.max_connection_age {
                let age = shared.clock.since(opened_at);
                if age >= max_age {
                    tracing::info!(?age, "Connection reached its maximum age; closing connection");
                    break;
                }
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;
    shared.metrics.rpc_open_connections.dec();
    result?;

    if let Err(error) = stream.shutdown().await {
        tracing::debug!(?error, "Connection did not shut down cleanly");
    }
    Ok(())
}

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process will cause it to stop accepting new
/// connections. Requests already in progress are allowed to complete before the
/// process shuts down.
pub async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning service shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning service shutdown");
                halt_token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    struct Echo;

    impl Service for Echo {
        fn name(&self) -> &'static str {
            "Echo"
        }

        fn call(&self, request: Request) -> Option<ServiceFuture<'_>> {
            (request.method == "Echo").then(|| {
                Box::pin(async move {
                    Ok(Reply {
                        body: request.body,
                        binary: Some(request.binary),
                    })
                }) as ServiceFuture<'_>
            })
        }
    }

    fn shared(services: &[(&str, &[&str])]) -> anyhow::Result<Shared> {
        let acceptor = SslAcceptor::mozilla_intermediate_v5(openssl::ssl::SslMethod::tls())?.build();
        let mut registered: BTreeMap<&'static str, Arc<dyn Service>> = BTreeMap::new();
        registered.insert("Echo", Arc::new(Echo));
        registered.insert(HEALTH_SERVICE, Arc::new(Health));
        Ok(Shared {
            acceptor,
            services: registered,
            authorization: services
                .iter()
                .map(|(name, clients)| {
                    (
                        name.to_string(),
                        ServiceConfig {
                            client_names: clients.iter().map(|c| c.to_string()).collect(),
                        },
                    )
                })
                .collect(),
            max_connection_age: None,
            metrics: Metrics::new()?,
            clock: Arc::new(SystemClock),
        })
    }

    fn message(request: serde_json::Value, binary: &'static [u8]) -> Message {
        Message {
            json: Bytes::from(request.to_string()),
            binary: Bytes::from_static(binary),
        }
    }

    #[tokio::test]
    async fn dispatch_to_service() -> anyhow::Result<()> {
        let shared = shared(&[("Echo", &["ra.example.com"])])?;
        let request = serde_json::json!({
            "request_id": 3, "service": "Echo", "method": "Echo", "body": {"hello": "world"}
        });
        let (response, binary) = shared
            .dispatch(&["ra.example.com".to_string()], message(request, b"payload"))
            .await;

        assert_eq!(response.request_id, 3);
        match response.response {
            Response::Ok { body } => assert_eq!(body, serde_json::json!({"hello": "world"})),
            other => panic!("unexpected response {other:?}"),
        }
        assert_eq!(binary.as_deref(), Some(&b"payload"[..]));
        assert!(shared
            .metrics
            .encode_text()?
            .contains(r#"ct_publisher_rpc_requests_total{method="Echo",service="Echo",status="ok"} 1"#));
        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_client() -> anyhow::Result<()> {
        let shared = shared(&[("Echo", &["ra.example.com"])])?;
        let request = serde_json::json!({"request_id": 1, "service": "Echo", "method": "Echo"});
        let (response, _) = shared
            .dispatch(&["intruder.example.com".to_string()], message(request, b""))
            .await;

        match response.response {
            Response::Error {
                reason: ServerError::Unauthorized { service },
            } => assert_eq!(service, "Echo"),
            other => panic!("unexpected response {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn unknown_service_and_method() -> anyhow::Result<()> {
        let shared = shared(&[("Echo", &["ra"])])?;
        let peer = ["ra".to_string()];

        let request = serde_json::json!({"request_id": 1, "service": "Nope", "method": "Echo"});
        let (response, _) = shared.dispatch(&peer, message(request, b"")).await;
        assert!(matches!(response.response, Response::Unsupported));

        let request = serde_json::json!({"request_id": 2, "service": "Echo", "method": "Nope"});
        let (response, _) = shared.dispatch(&peer, message(request, b"")).await;
        assert!(matches!(response.response, Response::Unsupported));
        assert_eq!(response.request_id, 2);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_request_keeps_request_id() -> anyhow::Result<()> {
        let shared = shared(&[])?;
        let request = serde_json::json!({"request_id": 9, "what": "is this"});
        let (response, _) = shared.dispatch(&["ra".to_string()], message(request, b"")).await;
        assert_eq!(response.request_id, 9);
        assert!(matches!(response.response, Response::Unsupported));
        Ok(())
    }

    // Health is open to any authenticated client unless it is configured.
    #[tokio::test]
    async fn health_authorization() -> anyhow::Result<()> {
        let request = serde_json::json!({"request_id": 1, "service": "Health", "method": "Check"});

        let open = shared(&[])?;
        let (response, _) = open
            .dispatch(&["anyone".to_string()], message(request.clone(), b""))
            .await;
        match response.response {
            Response::Ok { body } => {
                let health: HealthCheckResponse = serde_json::from_value(body)?;
                assert_eq!(health.status, ServingStatus::Serving);
            }
            other => panic!("unexpected response {other:?}"),
        }

        let restricted = shared(&[("Health", &["monitor"])])?;
        let (response, _) = restricted
            .dispatch(&["anyone".to_string()], message(request, b""))
            .await;
        assert!(matches!(
            response.response,
            Response::Error {
                reason: ServerError::Unauthorized { .. }
            }
        ));
        Ok(())
    }

    fn grpc_config(services: &[&str]) -> GrpcConfig {
        GrpcConfig {
            address: "127.0.0.1:0".to_string(),
            max_connection_age_seconds: 0,
            services: services
                .iter()
                .map(|name| (name.to_string(), ServiceConfig::default()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn build_requires_service_config() -> anyhow::Result<()> {
        let tls = SslAcceptor::mozilla_intermediate_v5(openssl::ssl::SslMethod::tls())?.build();
        let error = ServerBuilder::new(grpc_config(&[]))
            .add(Arc::new(Echo))
            .build(tls, Metrics::new()?, Arc::new(SystemClock))
            .await
            .err()
            .expect("building should fail");
        assert!(error.to_string().contains("service Echo has no entry"));
        Ok(())
    }

    #[tokio::test]
    async fn build_rejects_unknown_service_config() -> anyhow::Result<()> {
        let tls = SslAcceptor::mozilla_intermediate_v5(openssl::ssl::SslMethod::tls())?.build();
        let error = ServerBuilder::new(grpc_config(&["Echo", "Publisher"]))
            .add(Arc::new(Echo))
            .build(tls, Metrics::new()?, Arc::new(SystemClock))
            .await
            .err()
            .expect("building should fail");
        assert!(error
            .to_string()
            .contains("publisher.grpc.services.Publisher does not match any service"));
        Ok(())
    }

    #[tokio::test]
    async fn build_and_halt() -> anyhow::Result<()> {
        let tls = SslAcceptor::mozilla_intermediate_v5(openssl::ssl::SslMethod::tls())?.build();
        let server = ServerBuilder::new(grpc_config(&["Echo", "Health"]))
            .add(Arc::new(Echo))
            .build(tls, Metrics::new()?, Arc::new(SystemClock))
            .await?;
        assert_ne!(server.local_addr().port(), 0);

        let halt_token = server.halt_token();
        let task = tokio::spawn(server.start());
        halt_token.cancel();
        task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn build_with_max_connection_age() -> anyhow::Result<()> {
        let tls = SslAcceptor::mozilla_intermediate_v5(openssl::ssl::SslMethod::tls())?.build();
        let mut config = grpc_config(&["Echo"]);
        config.max_connection_age_seconds = 30;
        let server = ServerBuilder::new(config)
            .add(Arc::new(Echo))
            .build(tls, Metrics::new()?, Arc::new(SystemClock))
            .await?;

        assert_eq!(
            server.shared.max_connection_age,
            Some(Duration::from_secs(30))
        );
        assert!(server.shared.authorization.contains_key("Echo"));
        Ok(())
    }

    // A Check that arrives after shutdown begins is answered the same as any other.
    #[tokio::test]
    async fn health_after_halt() -> anyhow::Result<()> {
        let tls = SslAcceptor::mozilla_intermediate_v5(openssl::ssl::SslMethod::tls())?.build();
        let server = ServerBuilder::new(grpc_config(&[]))
            .build(tls, Metrics::new()?, Arc::new(SystemClock))
            .await?;
        server.halt_token().cancel();

        let request = serde_json::json!({"request_id": 4, "service": "Health", "method": "Check"});
        let (response, _) = server
            .shared
            .dispatch(&["ra".to_string()], message(request, b""))
            .await;
        match response.response {
            Response::Ok { body } => {
                let health: HealthCheckResponse = serde_json::from_value(body)?;
                assert_eq!(health.status, ServingStatus::Serving);
            }
            other => panic!("unexpected response {other:?}"),
        }
        Ok(())
    }
}
