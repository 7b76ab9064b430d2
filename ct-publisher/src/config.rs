// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Configuration for the publisher service.
//!
//! The configuration file is TOML; files ending in `.json` are parsed as JSON instead. Unknown
//! keys are ignored so older binaries accept newer configuration files.

use std::{
    collections::BTreeMap,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use openssl::{
    error::ErrorStack,
    ssl::{SslAcceptor, SslConnector, SslFiletype, SslMethod, SslVerifyMode, SslVersion},
    x509::X509,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Credentials required to authenticate connections.
///
/// It is highly recommended that you use systemd credentials to ensure the private key is
/// only accessible to the service using it. If the paths provided are relative, they are
/// resolved against the `$CREDENTIALS_DIRECTORY` environment variable when it is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// The PEM-encoded private key matching `certificate`.
    pub private_key: PathBuf,
    /// The path to the PEM-encoded certificate presented to peers.
    pub certificate: PathBuf,
    /// The path to the PEM-encoded certificate authorities used to verify peers.
    pub ca_certificate: PathBuf,
}

impl Credentials {
    pub(crate) fn ssl_connector(&self) -> Result<SslConnector, ErrorStack> {
        let mut connector = SslConnector::builder(SslMethod::tls())?;
        connector.set_verify(SslVerifyMode::PEER);
        connector.set_min_proto_version(Some(SslVersion::TLS1_3))?;
        connector.set_max_proto_version(Some(SslVersion::TLS1_3))?;
        connector.set_ca_file(&self.ca_certificate)?;
        connector.set_private_key_file(&self.private_key, SslFiletype::PEM)?;
        connector.set_certificate_file(&self.certificate, SslFiletype::PEM)?;
        connector.check_private_key()?;

        Ok(connector.build())
    }

    /// Build the TLS acceptor for the RPC listener.
    ///
    /// Peers must present a certificate issued by one of the authorities in `ca_certificate`.
    /// The material is loaded once; changes on disk require a restart.
    pub fn ssl_acceptor(&self) -> anyhow::Result<SslAcceptor> {
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        let client_ca_certs = X509::stack_from_pem(&std::fs::read(&self.ca_certificate)?)?;
        if client_ca_certs.is_empty() {
            return Err(anyhow::anyhow!(
                "no certificates found in {}",
                self.ca_certificate.display()
            ));
        }
        acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        acceptor.set_min_proto_version(Some(SslVersion::TLS1_3))?;
        acceptor.set_max_proto_version(Some(SslVersion::TLS1_3))?;
        for ca_cert in &client_ca_certs {
            acceptor.add_client_ca(ca_cert)?;
        }
        acceptor.set_ca_file(&self.ca_certificate)?;
        acceptor.set_private_key_file(&self.private_key, SslFiletype::PEM)?;
        acceptor.set_certificate_file(&self.certificate, SslFiletype::PEM)?;
        acceptor.check_private_key()?;

        Ok(acceptor.build())
    }

    /// Fix up any relative paths in the configuration file to use the provided credentials directory.
    ///
    /// # Errors
    ///
    /// If a relative path doesn't exist in the credentials directory, an error naming the
    /// field is returned.
    pub fn with_credentials_dir(&mut self, credentials_dir: &Path) -> Result<(), ConfigError> {
        if self.private_key.is_absolute() {
            tracing::warn!(
                private_key = self.private_key.display().to_string(),
                "Path to private key file is absolute; consider using systemd credentials"
            );
        }
        for (field, path) in [
            ("publisher.tls.private_key", &mut self.private_key),
            ("publisher.tls.certificate", &mut self.certificate),
            ("publisher.tls.ca_certificate", &mut self.ca_certificate),
        ] {
            if path.is_absolute() {
                continue;
            }
            *path = credentials_dir.join(&*path);
            if !path.exists() {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: format!(
                        "no file named '{}' found in credentials directory",
                        path.display()
                    ),
                });
            }
        }

        Ok(())
    }
}

/// The complete configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub syslog: SyslogConfig,
    #[serde(default)]
    pub open_telemetry: OpenTelemetryConfig,
}

/// Settings for the publisher service itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// RPC listener settings.
    #[serde(default)]
    pub grpc: GrpcConfig,

    /// The address of the diagnostics HTTP server, which serves Prometheus metrics at
    /// `/metrics`. Leave empty to disable it.
    #[serde(default)]
    pub debug_addr: String,

    /// If this is non-zero, blocking events are sampled such that one event is recorded
    /// for every `block_profile_rate` nanoseconds runtime threads spend blocked.
    #[serde(default)]
    pub block_profile_rate: u64,

    /// The User-Agent header to send to CT logs.
    ///
    /// Defaults to [`crate::DEFAULT_USER_AGENT`] when empty.
    #[serde(default)]
    pub user_agent: String,

    /// Feature flags, applied to the process-wide registry in [`crate::features`].
    #[serde(default)]
    pub features: BTreeMap<String, bool>,

    /// A list of lists of certificate filenames. Each inner list is a chain, starting with the
    /// issuing intermediate, followed by one or more additional certificates, up to and
    /// including a root.
    #[serde(default)]
    pub chains: Option<Vec<Vec<PathBuf>>>,

    /// The TLS credentials for the RPC listener.
    pub tls: Credentials,
}

/// RPC listener settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrpcConfig {
    /// The `host:port` to listen on.
    #[serde(default)]
    pub address: String,

    /// Connections are closed once they have been open this many seconds. Zero means
    /// connections may live forever.
    #[serde(default)]
    pub max_connection_age_seconds: u64,

    /// Per-service settings, keyed by service name (e.g. `Publisher`). Every service the
    /// server provides, other than `Health`, must have an entry.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl GrpcConfig {
    /// Resolve the listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            field: "publisher.grpc.address".to_string(),
            reason,
        };
        if self.address.is_empty() {
            return Err(invalid("no listen address configured".to_string()));
        }
        self.address
            .to_socket_addrs()
            .map_err(|error| invalid(format!("cannot resolve {:?}: {error}", self.address)))?
            .next()
            .ok_or_else(|| invalid(format!("{:?} resolved to no addresses", self.address)))
    }

    pub fn max_connection_age(&self) -> Option<Duration> {
        (self.max_connection_age_seconds != 0)
            .then(|| Duration::from_secs(self.max_connection_age_seconds))
    }
}

/// Settings for a single RPC service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Names that may call this service. A caller matches when its certificate's common name
    /// or one of its DNS subject alternative names is in this list.
    #[serde(default)]
    pub client_names: Vec<String>,
}

/// Log output settings.
///
/// Levels are syslog severities: 0-3 log errors only, 4 adds warnings, 5 and 6 add
/// informational messages, and 7 adds debug messages. -1 disables the output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyslogConfig {
    /// Human-readable logs written to stderr.
    #[serde(default = "default_stdout_level")]
    pub stdout_level: i8,
    /// Structured (JSON) logs written to stdout for collection by journald or a syslog daemon.
    #[serde(default = "default_syslog_level")]
    pub syslog_level: i8,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            stdout_level: default_stdout_level(),
            syslog_level: default_syslog_level(),
        }
    }
}

fn default_stdout_level() -> i8 {
    6
}

fn default_syslog_level() -> i8 {
    -1
}

/// Span export settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// The OTLP (gRPC) collector endpoint, e.g. `http://localhost:4317`. Leave empty to
    /// disable span export.
    #[serde(default)]
    pub endpoint: String,
    /// The fraction of root spans to sample, between 0 and 1.
    #[serde(default)]
    pub sample_ratio: f64,
}

impl Config {
    /// Check the structure of the configuration beyond what the types enforce.
    ///
    /// A missing `chains` key is not an error here; the bundle registry rejects it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(chains) = &self.publisher.chains {
            if chains.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "publisher.chains".to_string(),
                    reason: "at least one chain is required".to_string(),
                });
            }
            for (index, chain) in chains.iter().enumerate() {
                if chain.len() < 2 {
                    return Err(ConfigError::Invalid {
                        field: format!("publisher.chains[{index}]"),
                        reason: format!(
                            "a chain requires at least 2 certificates, found {}",
                            chain.len()
                        ),
                    });
                }
                if let Some(position) = chain.iter().position(|p| p.as_os_str().is_empty()) {
                    return Err(ConfigError::Invalid {
                        field: format!("publisher.chains[{index}][{position}]"),
                        reason: "certificate path must not be empty".to_string(),
                    });
                }
            }
        }

        let ratio = self.open_telemetry.sample_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::Invalid {
                field: "open_telemetry.sample_ratio".to_string(),
                reason: format!("must be between 0 and 1, got {ratio}"),
            });
        }

        for (field, level) in [
            ("syslog.stdout_level", self.syslog.stdout_level),
            ("syslog.syslog_level", self.syslog.syslog_level),
        ] {
            if !(-1..=7).contains(&level) {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: format!("must be a syslog severity (0-7) or -1, got {level}"),
                });
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            publisher: PublisherConfig {
                grpc: GrpcConfig {
                    address: "[::]:9091".to_string(),
                    max_connection_age_seconds: 0,
                    services: BTreeMap::from([(
                        "Publisher".to_string(),
                        ServiceConfig {
                            client_names: vec!["ra.example.com".to_string()],
                        },
                    )]),
                },
                debug_addr: "127.0.0.1:8009".to_string(),
                block_profile_rate: 0,
                user_agent: String::new(),
                features: BTreeMap::new(),
                chains: Some(vec![vec![
                    PathBuf::from("/etc/ct-publisher/intermediate.pem"),
                    PathBuf::from("/etc/ct-publisher/root.pem"),
                ]]),
                tls: Credentials {
                    private_key: PathBuf::from("ct-publisher.private_key.pem"),
                    certificate: PathBuf::from("ct-publisher.certificate.pem"),
                    ca_certificate: PathBuf::from("ct-publisher.ca_certificate.pem"),
                },
            },
            syslog: SyslogConfig::default(),
            open_telemetry: OpenTelemetryConfig::default(),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

/// Read, parse, and validate the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: Config = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    } else {
        toml::from_str(&contents).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }
    .inspect_err(|_| {
        eprintln!("Example config file:\n\n{}", Config::default());
    })?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const MINIMAL: &str = r#"
[publisher]
chains = [["/etc/i.pem", "/etc/r.pem"]]

[publisher.tls]
private_key = "key.pem"
certificate = "cert.pem"
ca_certificate = "ca.pem"
"#;

    fn write_config(suffix: &str, contents: &str) -> anyhow::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile()?;
        file.write_all(contents.as_bytes())?;
        Ok(file)
    }

    #[test]
    fn minimal_config_defaults() -> anyhow::Result<()> {
        let file = write_config(".toml", MINIMAL)?;
        let config = load_config(file.path())?;

        assert_eq!(config.publisher.user_agent, "");
        assert_eq!(config.publisher.block_profile_rate, 0);
        assert!(config.publisher.features.is_empty());
        assert_eq!(config.syslog.stdout_level, 6);
        assert_eq!(config.syslog.syslog_level, -1);
        assert_eq!(config.open_telemetry.endpoint, "");
        assert_eq!(
            config.publisher.chains,
            Some(vec![vec![
                PathBuf::from("/etc/i.pem"),
                PathBuf::from("/etc/r.pem")
            ]])
        );
        Ok(())
    }

    #[test]
    fn unknown_fields_are_ignored() -> anyhow::Result<()> {
        let contents = format!(
            "{MINIMAL}\n[publisher.someday]\nmaybe = true\n\n[beeline]\nenabled = false\n"
        );
        let file = write_config(".toml", &contents)?;
        load_config(file.path())?;
        Ok(())
    }

    #[test]
    fn json_config() -> anyhow::Result<()> {
        let contents = r#"{
            "publisher": {
                "user_agent": "test-agent/2.0",
                "block_profile_rate": 1000000,
                "features": {"FasterThings": true},
                "grpc": {"address": "127.0.0.1:9091", "services": {"Publisher": {"client_names": ["ra"]}}},
                "chains": [["/a.pem", "/b.pem", "/c.pem"]],
                "tls": {"private_key": "k", "certificate": "c", "ca_certificate": "ca"},
                "unknown": 42
            },
            "syslog": {"stdout_level": 7, "syslog_level": 6}
        }"#;
        let file = write_config(".json", contents)?;
        let config = load_config(file.path())?;

        assert_eq!(config.publisher.user_agent, "test-agent/2.0");
        assert_eq!(config.publisher.block_profile_rate, 1_000_000);
        assert_eq!(config.publisher.features.get("FasterThings"), Some(&true));
        assert_eq!(
            config.publisher.grpc.services["Publisher"].client_names,
            vec!["ra".to_string()]
        );
        assert_eq!(config.syslog.stdout_level, 7);
        Ok(())
    }

    #[test]
    fn chain_of_two_accepted() -> anyhow::Result<()> {
        let file = write_config(".toml", MINIMAL)?;
        assert!(load_config(file.path()).is_ok());
        Ok(())
    }

    #[test]
    fn chain_of_one_rejected() -> anyhow::Result<()> {
        let contents = MINIMAL.replace(
            r#"chains = [["/etc/i.pem", "/etc/r.pem"]]"#,
            r#"chains = [["/etc/i.pem", "/etc/r.pem"], ["/etc/lonely.pem"]]"#,
        );
        let file = write_config(".toml", &contents)?;
        match load_config(file.path()) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "publisher.chains[1]"),
            other => panic!("expected a validation error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn empty_chains_rejected() -> anyhow::Result<()> {
        let contents = MINIMAL.replace(
            r#"chains = [["/etc/i.pem", "/etc/r.pem"]]"#,
            "chains = []",
        );
        let file = write_config(".toml", &contents)?;
        match load_config(file.path()) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "publisher.chains"),
            other => panic!("expected a validation error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn empty_path_rejected() -> anyhow::Result<()> {
        let contents = MINIMAL.replace(
            r#"chains = [["/etc/i.pem", "/etc/r.pem"]]"#,
            r#"chains = [["/etc/i.pem", ""]]"#,
        );
        let file = write_config(".toml", &contents)?;
        let error = load_config(file.path()).unwrap_err();
        assert_eq!(
            error.to_string(),
            "publisher.chains[0][1]: certificate path must not be empty"
        );
        Ok(())
    }

    // A missing key is allowed through validation so the registry can report it.
    #[test]
    fn missing_chains_passes_validation() -> anyhow::Result<()> {
        let contents = MINIMAL.replace(r#"chains = [["/etc/i.pem", "/etc/r.pem"]]"#, "");
        let file = write_config(".toml", &contents)?;
        let config = load_config(file.path())?;
        assert!(config.publisher.chains.is_none());
        Ok(())
    }

    #[test]
    fn missing_file() {
        let error = load_config(Path::new("/this/path/does/not/exist.toml")).unwrap_err();
        assert!(matches!(error, ConfigError::Read { .. }));
        assert!(error.to_string().contains("/this/path/does/not/exist.toml"));
    }

    #[test]
    fn malformed_toml_names_path() -> anyhow::Result<()> {
        let file = write_config(".toml", "[publisher\nchains = ")?;
        let error = load_config(file.path()).unwrap_err();
        assert!(matches!(error, ConfigError::Toml { .. }));
        assert!(error
            .to_string()
            .contains(&file.path().display().to_string()));
        Ok(())
    }

    #[test]
    fn sample_ratio_out_of_range() -> anyhow::Result<()> {
        let contents = format!("{MINIMAL}\n[open_telemetry]\nsample_ratio = 1.5\n");
        let file = write_config(".toml", &contents)?;
        match load_config(file.path()) {
            Err(ConfigError::Invalid { field, .. }) => {
                assert_eq!(field, "open_telemetry.sample_ratio")
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
        Ok(())
    }

    // The example printed on parse failures must itself be a valid configuration.
    #[test]
    fn default_round_trips() -> anyhow::Result<()> {
        let file = write_config(".toml", &Config::default().to_string())?;
        let config = load_config(file.path())?;
        assert_eq!(config.publisher.grpc.address, "[::]:9091");
        Ok(())
    }

    #[test]
    fn socket_addr_requires_address() {
        let grpc = GrpcConfig::default();
        assert!(grpc.socket_addr().is_err());

        let grpc = GrpcConfig {
            address: "127.0.0.1:8000".to_string(),
            ..Default::default()
        };
        assert_eq!(
            grpc.socket_addr().unwrap(),
            "127.0.0.1:8000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn credentials_dir_resolves_relative_paths() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["key.pem", "cert.pem"] {
            std::fs::write(dir.path().join(name), b"")?;
        }
        let mut creds = Credentials {
            private_key: "key.pem".into(),
            certificate: "cert.pem".into(),
            ca_certificate: "/etc/ssl/ca.pem".into(),
        };
        creds.with_credentials_dir(dir.path())?;
        assert_eq!(creds.private_key, dir.path().join("key.pem"));
        assert_eq!(creds.certificate, dir.path().join("cert.pem"));
        assert_eq!(creds.ca_certificate, PathBuf::from("/etc/ssl/ca.pem"));

        let mut creds = Credentials {
            private_key: "missing.pem".into(),
            certificate: "cert.pem".into(),
            ca_certificate: "/etc/ssl/ca.pem".into(),
        };
        match creds.with_credentials_dir(dir.path()) {
            Err(ConfigError::Invalid { field, .. }) => {
                assert_eq!(field, "publisher.tls.private_key")
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
        Ok(())
    }
}
