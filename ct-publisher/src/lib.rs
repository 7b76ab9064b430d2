// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# CT Publisher

The publisher accepts requests from other parts of a certificate authority to submit
certificates (or precertificates) to [Certificate Transparency][1] logs and hands back the
Signed Certificate Timestamps the logs return.

Logs only accept a submission when it includes the chain up to a root they trust, so the
publisher is configured with one chain per issuing intermediate. At startup each chain is
loaded from disk, keyed by its issuer's name, and converted into the sequence of DER blobs the
log expects. The result is an immutable [`bundle::BundleRegistry`] that the running service
consults for every submission.

## Components

The service is started by the `ct-publisher` binary, which follows a strictly linear bootstrap
(see [`bootstrap`]): load the configuration, build the bundle registry, set up TLS, and start
the RPC server. Any failure along the way is fatal, so the server never accepts a request
before the registry is complete.

Clients connect over mutual TLS. Each connection carries a sequence of framed JSON requests
addressed to a named service; the publisher registers the `Publisher` service and the server
always provides a `Health` service. A small [`client::Client`] is included for tooling and
tests.

## Crate features

* **cli** -
  Include the `ct-publisher` command-line interface. This is a default feature.

[1]: https://certificate.transparency.dev/
*/

pub mod bootstrap;
pub mod bundle;
#[cfg(feature = "cli")]
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod debug;
pub mod error;
pub mod features;
pub mod issuance;
pub mod observability;
pub mod profiling;
pub mod protocol;
pub mod publisher;
pub mod server;

/// The User-Agent sent on outbound CT submissions when none is configured.
pub const DEFAULT_USER_AGENT: &str = "certificate-transparency-go/1.0";

/// A short description of this build, logged at startup.
pub fn version_string() -> String {
    format!(
        "{} {} ({} {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}
