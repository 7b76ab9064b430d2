// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Define the command-line interface.

use std::path::PathBuf;

use clap::Parser;

use crate::bootstrap::Overrides;

/// Submit certificates to Certificate Transparency logs on behalf of a certificate authority.
///
/// The publisher loads one certificate chain per issuing intermediate, then serves the
/// `Publisher` RPC service over mutual TLS. Logging, metrics, and span export are configured
/// in the same file under the `syslog` and `open_telemetry` tables.
///
/// Relative TLS credential paths are resolved against `$CREDENTIALS_DIRECTORY` when it is set,
/// which is where systemd places credentials loaded with `LoadCredential=`.
#[derive(Debug, Parser)]
#[command(name = "ct-publisher", version)]
pub struct Cli {
    /// The path to the publisher's configuration file.
    ///
    /// Files ending in `.json` are parsed as JSON; anything else is parsed as TOML.
    #[arg(long, short, env = "CT_PUBLISHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// The `host:port` to serve RPCs on, overriding `publisher.grpc.address`.
    #[arg(long)]
    pub addr: Option<String>,

    /// The `host:port` to serve metrics on, overriding `publisher.debug_addr`.
    #[arg(long)]
    pub debug_addr: Option<String>,
}

impl Cli {
    /// The configuration overrides given on the command line.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            addr: self.addr.clone().unwrap_or_default(),
            debug_addr: self.debug_addr.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides() {
        let cli = Cli::parse_from([
            "ct-publisher",
            "--config",
            "publisher.toml",
            "--addr",
            "127.0.0.1:9091",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("publisher.toml")));
        let overrides = cli.overrides();
        assert_eq!(overrides.addr, "127.0.0.1:9091");
        assert!(overrides.debug_addr.is_empty());
    }
}
