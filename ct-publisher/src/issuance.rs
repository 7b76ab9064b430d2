// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Loading issuer certificates and deriving their identity.

use std::{fmt, path::Path};

use openssl::{
    asn1::Asn1StringRef,
    nid::Nid,
    x509::{X509, X509NameRef, X509Ref},
};

use crate::error::ChainError;

/// A stable identifier for an issuer, derived from its subject name.
///
/// This is the SHA-256 digest of the DER encoding of the issuer's subject name. Since a
/// certificate's issuer field is a byte-for-byte copy of its issuer's subject, the id of a
/// leaf's issuer can be computed from the leaf alone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IssuerNameId([u8; 32]);

impl IssuerNameId {
    pub fn from_name(name: &X509NameRef) -> Result<Self, ChainError> {
        let der = name.to_der().map_err(ChainError::MalformedName)?;
        Ok(Self(openssl::sha::sha256(&der)))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for IssuerNameId {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl fmt::Display for IssuerNameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for IssuerNameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IssuerNameId({self})")
    }
}

/// A parsed X.509 certificate along with its DER encoding.
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
    der: Vec<u8>,
}

impl Certificate {
    pub fn from_x509(x509: X509) -> Result<Self, openssl::error::ErrorStack> {
        let der = x509.to_der()?;
        Ok(Self { x509, der })
    }

    pub fn from_der(der: &[u8]) -> Result<Self, openssl::error::ErrorStack> {
        let x509 = X509::from_der(der)?;
        Ok(Self {
            x509,
            der: der.to_vec(),
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn x509(&self) -> &X509Ref {
        &self.x509
    }

    /// The first common name in the subject, or an empty string if there is none.
    ///
    /// This is only meant for diagnostics.
    pub fn common_name(&self) -> String {
        self.x509
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| name_text(entry.data()))
            .map(str::to_string)
            .unwrap_or_default()
    }

    /// The id of this certificate as an issuer.
    pub fn name_id(&self) -> Result<IssuerNameId, ChainError> {
        IssuerNameId::from_name(self.x509.subject_name())
    }

    /// The id of the certificate that issued this one.
    pub fn issuer_name_id(&self) -> Result<IssuerNameId, ChainError> {
        IssuerNameId::from_name(self.x509.issuer_name())
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("common_name", &self.common_name())
            .field("der_len", &self.der.len())
            .finish()
    }
}

const PEM_BEGIN: &[u8] = b"-----BEGIN";

/// The text of a name attribute, or `None` if it is not UTF-8 or contains a NUL.
pub(crate) fn name_text(data: &Asn1StringRef) -> Option<&str> {
    std::str::from_utf8(data.as_slice())
        .ok()
        .filter(|text| !text.contains('\0'))
}

/// Load a single certificate from a PEM or DER encoded file.
///
/// PEM files must contain exactly one certificate. Text before the PEM block, like the output
/// of `openssl x509 -text` or PKCS#12 bag attributes, is ignored.
pub fn load_certificate(path: &Path) -> Result<Certificate, ChainError> {
    let contents = std::fs::read(path).map_err(|source| ChainError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if contents.iter().all(u8::is_ascii_whitespace) {
        return Err(ChainError::Empty {
            path: path.to_path_buf(),
        });
    }

    let parse_error = |source| ChainError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let is_pem = contents
        .windows(PEM_BEGIN.len())
        .any(|window| window == PEM_BEGIN);
    let certificate = if is_pem {
        let mut certs = X509::stack_from_pem(&contents).map_err(parse_error)?;
        if certs.len() != 1 {
            return Err(ChainError::MultipleCertificates {
                path: path.to_path_buf(),
                count: certs.len(),
            });
        }
        let x509 = certs.remove(0);
        Certificate::from_x509(x509).map_err(parse_error)?
    } else {
        Certificate::from_der(&contents).map_err(parse_error)?
    };
    tracing::debug!(path = %path.display(), common_name = certificate.common_name(), "Loaded certificate");

    Ok(certificate)
}

/// Load a chain of certificates, in order.
///
/// The first path is the issuing intermediate and the last is a root. Whether each certificate
/// actually signed the one before it is not checked.
pub fn load_chain<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Certificate>, ChainError> {
    if paths.len() < 2 {
        return Err(ChainError::TooShort { count: paths.len() });
    }
    paths
        .iter()
        .map(|path| load_certificate(path.as_ref()))
        .collect()
}
