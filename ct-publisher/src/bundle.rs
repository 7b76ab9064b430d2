// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Pre-computed CT submission bundles, keyed by issuer.

use std::{collections::HashMap, path::Path};

use crate::{
    error::RegistryError,
    issuance::{self, Certificate, IssuerNameId},
};

/// The DER-encoded certificates that follow a leaf in a CT submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtBundle(Vec<Vec<u8>>);

impl CtBundle {
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The complete chain to submit for `leaf`: the leaf followed by the bundle.
    pub fn chain_for(&self, leaf: &[u8]) -> Vec<Vec<u8>> {
        std::iter::once(leaf.to_vec())
            .chain(self.0.iter().cloned())
            .collect()
    }
}

/// Convert a chain into the form submitted to CT logs.
///
/// Every certificate is included, in chain order, starting with the issuing intermediate and
/// ending with the root.
pub fn ct_bundle_for_chain(chain: &[Certificate]) -> CtBundle {
    CtBundle(chain.iter().map(|cert| cert.der().to_vec()).collect())
}

/// An immutable mapping from issuer to the bundle submitted with certificates it issued.
#[derive(Debug, Clone, Default)]
pub struct BundleRegistry {
    bundles: HashMap<IssuerNameId, CtBundle>,
}

impl BundleRegistry {
    /// Load every configured chain and build the registry.
    ///
    /// Chains are processed in order and the first failure is returned. It is an error for
    /// two chains to start with certificates sharing an issuer name id, regardless of which
    /// chain was declared first.
    pub fn from_chains<P: AsRef<Path>>(chains: Option<&[Vec<P>]>) -> Result<Self, RegistryError> {
        let chains = chains.ok_or(RegistryError::NoChains)?;
        if chains.is_empty() {
            return Err(RegistryError::NoChains);
        }

        let mut bundles = HashMap::with_capacity(chains.len());
        for (index, files) in chains.iter().enumerate() {
            let load_error = |source| RegistryError::LoadChain {
                index,
                paths: files
                    .iter()
                    .map(|path| path.as_ref().display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                source,
            };
            let chain = issuance::load_chain(files).map_err(load_error)?;
            let issuer = &chain[0];
            let id = issuer.name_id().map_err(load_error)?;
            if bundles.contains_key(&id) {
                return Err(RegistryError::DuplicateIssuer {
                    common_name: issuer.common_name(),
                });
            }
            tracing::info!(
                issuer = issuer.common_name(),
                issuer_id = %id,
                length = chain.len(),
                "Registered CT bundle"
            );
            bundles.insert(id, ct_bundle_for_chain(&chain));
        }

        Ok(Self { bundles })
    }

    pub fn get(&self, id: &IssuerNameId) -> Option<&CtBundle> {
        self.bundles.get(id)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn issuers(&self) -> impl Iterator<Item = &IssuerNameId> {
        self.bundles.keys()
    }
}
