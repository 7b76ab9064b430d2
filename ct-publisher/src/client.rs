// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A client for the publisher.
//!
//! [`Client`] holds one connection open and re-establishes it when the server closes it, for
//! example because the connection reached its maximum age. [`Connection`] is the underlying
//! single connection, for callers that want to control the connection lifecycle themselves.

use std::{path::PathBuf, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::Mutex};
use tokio_openssl::SslStream;
use tracing::instrument;

use crate::{
    config::Credentials,
    error::{ClientError, ConnectionError, ProtocolError},
    protocol::{self, OuterRequest, OuterResponse, Response},
    publisher::{SubmissionKind, SubmitToSingleCtRequest, PUBLISHER_SERVICE, SUBMIT_TO_SINGLE_CT},
    server::{HealthCheckResponse, ServingStatus, HEALTH_SERVICE},
};

/// Configuration for the publisher client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The publisher's hostname. This is used to validate the server's TLS certificate.
    pub server_hostname: String,
    /// The `host:port` to connect to.
    pub server_address: String,
    /// How long to wait to connect, or for a response to a request, before giving up.
    pub request_timeout: Duration,
    /// The credentials to authenticate with. The certificate must have the `clientAuth`
    /// extended key usage, and its common name or a DNS name must be listed in the server's
    /// `client_names` for the services being called.
    pub credentials: Credentials,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_hostname: "publisher.example.com".to_string(),
            server_address: "publisher.example.com:9091".to_string(),
            request_timeout: Duration::from_secs(30),
            credentials: Credentials {
                private_key: PathBuf::from("ct-publisher.client.private_key.pem"),
                certificate: PathBuf::from("ct-publisher.client.certificate.pem"),
                ca_certificate: PathBuf::from("ct-publisher.ca_certificate.pem"),
            },
        }
    }
}

/// A single connection to the publisher.
pub struct Connection {
    stream: SslStream<TcpStream>,
    next_request_id: u64,
}

impl Connection {
    /// Connect and complete the TLS handshake.
    #[instrument(skip_all, err, fields(server = %config.server_address))]
    pub async fn connect(config: &Config) -> Result<Self, ClientError> {
        let connector = config.credentials.ssl_connector()?;
        let ssl = connector
            .configure()?
            .into_ssl(&config.server_hostname)?;

        let connect = async move {
            let tcp_stream = TcpStream::connect(&config.server_address).await?;
            let mut stream = SslStream::new(ssl, tcp_stream)?;
            Pin::new(&mut stream).connect().await?;
            Ok::<_, ConnectionError>(stream)
        };
        let stream = tokio::time::timeout(config.request_timeout, connect)
            .await
            .map_err(|_elapsed| ClientError::Timeout)??;
        tracing::debug!("Connected to the publisher");

        Ok(Self {
            stream,
            next_request_id: 0,
        })
    }

    /// Send a request and wait for its response.
    ///
    /// Returns the response body and binary payload.
    pub async fn call(
        &mut self,
        service: &str,
        method: &str,
        body: serde_json::Value,
        binary: Option<&[u8]>,
    ) -> Result<(serde_json::Value, Bytes), ClientError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let request = OuterRequest {
            request_id,
            service: service.to_string(),
            method: method.to_string(),
            body,
        };
        protocol::write_message(&mut self.stream, &request, binary).await?;

        let message = protocol::read_message(&mut self.stream)
            .await?
            .ok_or_else(|| {
                ConnectionError::from(ProtocolError::Framing(
                    "the server sent an empty frame".to_string(),
                ))
            })?;
        let response: OuterResponse = serde_json::from_slice(&message.json)?;
        if response.request_id != request_id {
            return Err(ConnectionError::from(ProtocolError::Framing(format!(
                "expected a response to request {request_id}, got {}",
                response.request_id
            )))
            .into());
        }

        match response.response {
            Response::Ok { body } => Ok((body, message.binary)),
            Response::Error { reason } => Err(reason.into()),
            Response::Unsupported => Err(ClientError::Unsupported),
        }
    }

    /// Tell the server no more requests are coming and close the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        protocol::write_end(&mut self.stream).await?;
        self.stream
            .shutdown()
            .await
            .map_err(ConnectionError::from)?;
        Ok(())
    }
}

/// A publisher client.
#[derive(Clone)]
pub struct Client {
    config: Arc<Config>,
    connection: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            connection: Arc::new(Mutex::new(None)),
        }
    }

    /// Get the current client configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    // Send a request, reconnecting once if the connection turns out to be closed.
    async fn send(
        &self,
        service: &str,
        method: &str,
        body: serde_json::Value,
        binary: Option<&[u8]>,
    ) -> Result<(serde_json::Value, Bytes), ClientError> {
        let mut connection_lock = self.connection.lock().await;
        let mut reconnected = false;
        loop {
            let (mut connection, fresh) = match connection_lock.take() {
                Some(connection) => (connection, false),
                None => (Connection::connect(&self.config).await?, true),
            };
            let result = tokio::time::timeout(
                self.config.request_timeout,
                connection.call(service, method, body.clone(), binary),
            )
            .await;

            match result {
                Ok(Err(ClientError::Connection(ConnectionError::Protocol(error)))) => {
                    break Err(ConnectionError::Protocol(error).into());
                }
                Ok(Err(ClientError::Connection(error))) if !fresh && !reconnected => {
                    tracing::info!(?error, "Connection to the publisher was lost; reconnecting...");
                    reconnected = true;
                }
                Ok(Err(error @ ClientError::Connection(_))) => break Err(error),
                Ok(result) => {
                    *connection_lock = Some(connection);
                    break result;
                }
                Err(_elapsed) => {
                    tracing::warn!("Request timed out without a response; dropping the connection");
                    break Err(ClientError::Timeout);
                }
            }
        }
    }

    /// Check whether the publisher is serving.
    pub async fn health(&self) -> Result<ServingStatus, ClientError> {
        let (body, _) = self
            .send(HEALTH_SERVICE, "Check", serde_json::json!({}), None)
            .await?;
        let response: HealthCheckResponse = serde_json::from_value(body)?;
        Ok(response.status)
    }

    /// Submit a DER-encoded certificate to a single CT log and return the serialized SCT.
    pub async fn submit_to_single_ct(
        &self,
        url: &str,
        public_key: &str,
        kind: SubmissionKind,
        certificate: &[u8],
    ) -> Result<Bytes, ClientError> {
        let request = SubmitToSingleCtRequest {
            url: url.to_string(),
            public_key: public_key.to_string(),
            kind,
        };
        let (_, sct) = self
            .send(
                PUBLISHER_SERVICE,
                SUBMIT_TO_SINGLE_CT,
                serde_json::to_value(&request)?,
                Some(certificate),
            )
            .await?;
        Ok(sct)
    }

    /// Close the connection, if one is open.
    pub async fn close(&self) -> Result<(), ClientError> {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await?;
        }
        Ok(())
    }
}
