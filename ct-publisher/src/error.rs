// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the publisher bootstrap, server, and client.

use std::path::PathBuf;

use zerocopy::TryCastError;

pub use crate::protocol::{Error as ProtocolError, ServerError};

/// Errors returned while loading and validating the configuration file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read at all.
    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the configuration schema.
    #[error("configuration file {path:?} is invalid: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The file is not valid JSON or does not match the configuration schema.
    #[error("configuration file {path:?} is invalid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The document parsed, but a field holds a value the service can't use.
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Errors that occur while reading certificates from disk.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChainError {
    #[error("failed to read certificate file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate file {path:?} is empty")]
    Empty { path: PathBuf },

    /// The file isn't a PEM or DER encoded X.509 certificate.
    #[error("certificate file {path:?} does not contain a valid certificate: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: openssl::error::ErrorStack,
    },

    /// PEM files must contain exactly one certificate.
    #[error("certificate file {path:?} contains {count} certificates; expected exactly one")]
    MultipleCertificates { path: PathBuf, count: usize },

    #[error("a chain requires at least 2 certificates, but {count} were provided")]
    TooShort { count: usize },

    /// The certificate's subject name could not be DER-encoded.
    #[error("certificate name is malformed: {0}")]
    MalformedName(#[source] openssl::error::ErrorStack),
}

/// Errors building the [`crate::bundle::BundleRegistry`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("No chain files provided")]
    NoChains,

    #[error("failed to load chain {index} ({paths}): {source}")]
    LoadChain {
        index: usize,
        paths: String,
        #[source]
        source: ChainError,
    },

    /// Two chains start with certificates that have the same issuer name id.
    #[error("Got multiple chains configured for issuer {common_name:?}")]
    DuplicateIssuer { common_name: String },
}

/// Errors that occur during the connection.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// An I/O occurred.
    ///
    /// This is very likely due to temporary networking issues and the operation
    /// should be retried.
    ///
    /// Be aware, however, that it could be because the specified hostname or
    /// port is incorrect, in which case retrying will never succeed.
    #[error("an I/O error occurred: {0}")]
    Io(std::io::Error),

    /// An OpenSSL error occurred.
    #[error("one or more openssl errors occurred: {0}")]
    SslErrors(#[from] openssl::error::ErrorStack),

    /// The TLS connection to the publisher failed.
    ///
    /// This could be due to a protocol level failure, like a handshake failure
    /// due to no common supported versions/ciphers/etc, or because the TLS
    /// certificate is incorrect, or due to a network-level failure.
    #[error("an SSL error occurred: {0}")]
    Ssl(#[from] openssl::ssl::Error),

    /// A protocol violation occurred.
    ///
    /// This occurs if the framing is invalid, a payload is too large, etc.
    /// This is almost certainly a bug.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(error: std::io::Error) -> Self {
        // I/O errors may occur due to a TLS error, like if the server rejects the client certificate
        // but then the client reads from the socket. Map those type of errors to our more specific
        // error variants.
        if let Some(ssl_error) = std::error::Error::source(&error)
            .and_then(|error| error.downcast_ref::<openssl::error::ErrorStack>())
        {
            ConnectionError::Ssl(ssl_error.to_owned().into())
        } else {
            ConnectionError::Io(error)
        }
    }
}

impl<S, D> From<TryCastError<S, D>> for ConnectionError
where
    D: zerocopy::TryFromBytes,
{
    fn from(value: TryCastError<S, D>) -> Self {
        ProtocolError::Framing(format!("{value:?}")).into()
    }
}

/// Errors the [`crate::client::Client`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Returned in the event that an error occurred while communicating with the publisher.
    /// Refer to [`ConnectionError`] for details on the possible errors and if retrying is
    /// advisable.
    #[error("connection error with the publisher: {0}")]
    Connection(#[from] ConnectionError),

    /// A general I/O error occurred, unrelated to the underlying network connection, such as
    /// failing to read the client's TLS certificate.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// The OpenSSL configuration derived from [`crate::config::Credentials`] is invalid.
    #[error("openssl could not be configured: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// Errors the server returned for a particular request.
    #[error("The server responded with an error: {0}")]
    Server(#[from] ServerError),

    /// The server didn't respond within the configured request timeout.
    #[error("timed out waiting for the publisher")]
    Timeout,

    /// The server doesn't know the requested service or method.
    #[error("The server does not support the request")]
    Unsupported,

    #[error("Failed to serialize a request or response to JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}
