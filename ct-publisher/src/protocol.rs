// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The wire protocol spoken between clients and the publisher.
//!
//! After the TLS handshake the client sends any number of requests, each answered by one
//! response. Every message is a [`Frame`] followed by `json_size` bytes of JSON and then
//! `binary_size` bytes of binary payload (for example, a DER-encoded certificate). A frame
//! where both sizes are zero indicates the client is done and the connection should be closed.

use std::collections::BTreeSet;

use bytes::{BufMut, Bytes, BytesMut};
use openssl::{nid::Nid, ssl::SslRef, x509::X509Ref};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{
    network_endian::U64, FromBytes, Immutable, IntoBytes, KnownLayout, TryFromBytes, Unaligned,
};

use crate::error::ConnectionError;

/// The largest JSON document accepted in a single message.
pub const MAX_JSON_SIZE: usize = 1024 * 32;
/// The largest binary payload accepted in a single message.
pub const MAX_BINARY_SIZE: usize = 1024 * 1024;

/// Protocol violations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The frame header or payload is malformed.
    #[error("invalid frame: {0}")]
    Framing(String),

    #[error("{kind} payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge {
        kind: &'static str,
        size: u64,
        limit: usize,
    },

    /// The peer's certificate has neither a common name nor a DNS name.
    #[error("the peer certificate does not include a name")]
    MissingPeerIdentity,

    #[error("malformed JSON message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors the server reports to clients for individual requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ServerError {
    #[error("the caller is not authorized to use the {service} service")]
    Unauthorized { service: String },

    #[error("the request is invalid: {0}")]
    BadRequest(String),

    #[error("the certificate could not be parsed")]
    MalformedCertificate,

    #[error("no CT bundle is configured for issuer {0}")]
    UnknownIssuer(String),

    #[error("no CT log client is available: {0}")]
    LogClientUnavailable(String),

    #[error("the CT log did not accept the submission: {0}")]
    Submission(String),

    #[error("the server is shutting down")]
    ShuttingDown,

    #[error("an internal error occurred")]
    Internal,
}

/// The header preceding every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Frame {
    pub json_size: U64,
    pub binary_size: U64,
}

impl Frame {
    pub fn new(json_size: u64, binary_size: u64) -> Self {
        Self {
            json_size: json_size.into(),
            binary_size: binary_size.into(),
        }
    }

    /// The frame that ends a session.
    pub fn end() -> Self {
        Self::new(0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.json_size.get() == 0 && self.binary_size.get() == 0
    }
}

/// A request addressed to a service and method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterRequest {
    /// Chosen by the client and echoed in the response.
    pub request_id: u64,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterResponse {
    pub request_id: u64,
    pub response: Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { body: serde_json::Value },
    Error { reason: ServerError },
    /// The service or method doesn't exist, or the request isn't understood.
    Unsupported,
}

/// A message read from the connection.
#[derive(Debug, Clone)]
pub struct Message {
    pub json: Bytes,
    pub binary: Bytes,
}

/// Read the next message.
///
/// Returns `None` if the peer sent the end-of-session frame.
pub async fn read_message<S>(stream: &mut S) -> Result<Option<Message>, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let mut frame_buffer = [0_u8; std::mem::size_of::<Frame>()];
    stream.read_exact(&mut frame_buffer).await?;
    let frame = Frame::try_ref_from_bytes(&frame_buffer)?;
    if frame.is_empty() {
        return Ok(None);
    }

    let json_size = checked_size("JSON", frame.json_size.get(), MAX_JSON_SIZE)?;
    let binary_size = checked_size("binary", frame.binary_size.get(), MAX_BINARY_SIZE)?;
    let frame_size = json_size + binary_size;
    let mut buffer = BytesMut::with_capacity(frame_size).limit(frame_size);
    while buffer.remaining_mut() != 0 {
        if stream.read_buf(&mut buffer).await? == 0 {
            return Err(Error::Framing(format!(
                "connection closed after {} of {frame_size} bytes",
                frame_size - buffer.remaining_mut()
            ))
            .into());
        }
    }
    let mut json = buffer.into_inner().freeze();
    let binary = json.split_off(json_size);

    Ok(Some(Message { json, binary }))
}

fn checked_size(kind: &'static str, size: u64, limit: usize) -> Result<usize, Error> {
    usize::try_from(size)
        .ok()
        .filter(|size| *size <= limit)
        .ok_or(Error::TooLarge { kind, size, limit })
}

/// Serialize `message` and write it, followed by the optional binary payload.
pub async fn write_message<S, T>(
    stream: &mut S,
    message: &T,
    binary: Option<&[u8]>,
) -> Result<(), ConnectionError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(message).map_err(Error::from)?;
    let binary = binary.unwrap_or_default();
    let frame = Frame::new(json.len() as u64, binary.len() as u64);
    stream.write_all(frame.as_bytes()).await?;
    stream.write_all(&json).await?;
    if !binary.is_empty() {
        stream.write_all(binary).await?;
    }
    stream.flush().await?;

    Ok(())
}

/// Tell the peer no more requests are coming.
pub async fn write_end<S>(stream: &mut S) -> Result<(), ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(Frame::end().as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// The names a peer authenticated as: the subject common names and DNS subject alternative
/// names of its certificate.
pub fn peer_names(ssl: &SslRef) -> Result<Vec<String>, Error> {
    let certificate = ssl.peer_certificate().ok_or(Error::MissingPeerIdentity)?;
    let names = certificate_names(&certificate);
    if names.is_empty() {
        Err(Error::MissingPeerIdentity)
    } else {
        Ok(names)
    }
}

/// The distinct common names and DNS subject alternative names of a certificate, sorted.
fn certificate_names(certificate: &X509Ref) -> Vec<String> {
    let mut names = certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .filter_map(|entry| crate::issuance::name_text(entry.data()))
        .map(str::to_string)
        .collect::<BTreeSet<_>>();
    if let Some(alt_names) = certificate.subject_alt_names() {
        names.extend(
            alt_names
                .iter()
                .filter_map(|name| name.dnsname())
                .map(str::to_string),
        );
    }
    names.into_iter().collect()
}
