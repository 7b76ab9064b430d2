// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Utilities for testing the CT publisher, useful across unit tests, end-to-end tests, and the
//! CLI tests.
//!
//! Everything is generated in-process with OpenSSL. Keys are P-256 so generating a few dozen
//! hierarchies in a property test stays fast.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

pub mod certs;

use certs::Issuer;

/// Paths to a private key, its certificate, and the CA that issued it.
#[derive(Debug, Clone)]
pub struct CredentialPaths {
    pub private_key: PathBuf,
    pub certificate: PathBuf,
    pub ca_certificate: PathBuf,
}

/// Mutual TLS credentials for a server and any number of clients, all issued by one CA.
pub struct Creds {
    pub ca: Issuer,
    pub server: CredentialPaths,
    pub clients: BTreeMap<String, CredentialPaths>,
}

impl Creds {
    /// Get the credentials for a client created by [`create_credentials`].
    ///
    /// # Panics
    ///
    /// Panics if no client by that name was created.
    pub fn client(&self, name: &str) -> &CredentialPaths {
        self.clients
            .get(name)
            .unwrap_or_else(|| panic!("no credentials were created for client {name}"))
    }
}

// Generate a set of credentials in the given directory.
pub fn create_credentials(
    dir: &Path,
    server_hostname: &str,
    client_names: &[&str],
) -> anyhow::Result<Creds> {
    let creds_directory = dir.join("creds");
    std::fs::create_dir_all(&creds_directory)?;

    let ca = certs::root("CT Publisher Test CA")?;
    let ca_certificate = certs::write_pem(&creds_directory, "ca_certificate.pem", &ca.cert)?;

    let server = certs::tls_identity(server_hostname, &ca, certs::Usage::Server)?;
    let server = write_identity(&creds_directory, "server", &server, &ca_certificate)?;

    let mut clients = BTreeMap::new();
    for name in client_names {
        let client = certs::tls_identity(name, &ca, certs::Usage::Client)?;
        let paths = write_identity(&creds_directory, name, &client, &ca_certificate)?;
        clients.insert(name.to_string(), paths);
    }

    Ok(Creds {
        ca,
        server,
        clients,
    })
}

fn write_identity(
    dir: &Path,
    name: &str,
    identity: &Issuer,
    ca_certificate: &Path,
) -> anyhow::Result<CredentialPaths> {
    let certificate = certs::write_pem(dir, &format!("{name}.certificate.pem"), &identity.cert)?;
    let private_key = dir.join(format!("{name}.private_key.pem"));
    std::fs::write(&private_key, identity.key.private_key_to_pem_pkcs8()?)?;

    Ok(CredentialPaths {
        private_key,
        certificate,
        ca_certificate: ca_certificate.to_path_buf(),
    })
}
