// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Certificate hierarchies for tests.

use std::path::{Path, PathBuf};

use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509Name, X509NameBuilder, X509,
    },
};

/// A certificate and its private key.
pub struct Issuer {
    pub cert: X509,
    pub key: PKey<Private>,
}

/// What a TLS identity certificate is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Server,
    Client,
}

/// Files making up a chain written by [`write_chain`].
pub struct ChainFiles {
    pub root: Issuer,
    pub intermediate: Issuer,
    /// The issuing intermediate first, then any cross intermediates, then the root.
    pub paths: Vec<PathBuf>,
}

fn new_key() -> anyhow::Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
}

fn name(common_name: &str) -> anyhow::Result<X509Name> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "CT Publisher Tests")?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name.build())
}

fn builder(
    common_name: &str,
    key: &PKey<Private>,
    issuer: Option<&Issuer>,
) -> anyhow::Result<X509Builder> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;

    let mut serial_number = [0; 16];
    openssl::rand::rand_bytes(&mut serial_number)?;
    let mut serial_number = BigNum::from_slice(&serial_number)?;
    serial_number.set_negative(false);
    builder.set_serial_number(Asn1Integer::from_bn(&serial_number)?.as_ref())?;

    let subject_name = name(common_name)?;
    builder.set_subject_name(&subject_name)?;
    let issuer_name = issuer.map_or(subject_name.as_ref(), |issuer| issuer.cert.subject_name());
    builder.set_issuer_name(issuer_name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(30)?.as_ref())?;

    let subject_key_id =
        SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(subject_key_id)?;
    if let Some(issuer) = issuer {
        let authority_key_id = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&issuer.cert), None))?;
        builder.append_extension(authority_key_id)?;
    }

    Ok(builder)
}

fn ca(common_name: &str, parent: Option<&Issuer>) -> anyhow::Result<Issuer> {
    let key = new_key()?;
    let mut builder = builder(common_name, &key, parent)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build()?,
    )?;
    let signing_key = parent.map_or(&key, |parent| &parent.key);
    builder.sign(signing_key, MessageDigest::sha256())?;

    Ok(Issuer {
        cert: builder.build(),
        key,
    })
}

/// A self-signed root.
pub fn root(common_name: &str) -> anyhow::Result<Issuer> {
    ca(common_name, None)
}

/// An intermediate issued by `parent`.
pub fn intermediate(common_name: &str, parent: &Issuer) -> anyhow::Result<Issuer> {
    ca(common_name, Some(parent))
}

/// A server certificate for `dns_name` issued by `issuer`, like those submitted to CT logs.
pub fn leaf(dns_name: &str, issuer: &Issuer) -> anyhow::Result<Issuer> {
    tls_identity(dns_name, issuer, Usage::Server)
}

/// An end-entity certificate whose common name and DNS name are `name`.
pub fn tls_identity(name: &str, issuer: &Issuer, usage: Usage) -> anyhow::Result<Issuer> {
    tls_identity_with_dns_names(name, &[name], issuer, usage)
}

/// A TLS identity whose subject common name is `name` and whose DNS subject alternative names
/// are `dns_names`, in order.
pub fn tls_identity_with_dns_names(
    name: &str,
    dns_names: &[&str],
    issuer: &Issuer,
    usage: Usage,
) -> anyhow::Result<Issuer> {
    let key = new_key()?;
    let mut builder = builder(name, &key, Some(issuer))?;
    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .build()?,
    )?;
    let mut extended_key_usage = ExtendedKeyUsage::new();
    match usage {
        Usage::Server => extended_key_usage.server_auth(),
        Usage::Client => extended_key_usage.client_auth(),
    };
    builder.append_extension(extended_key_usage.build()?)?;
    let mut subject_alt_name = SubjectAlternativeName::new();
    for dns_name in dns_names {
        subject_alt_name.dns(dns_name);
    }
    let subject_alt_name =
        subject_alt_name.build(&builder.x509v3_context(Some(&issuer.cert), None))?;
    builder.append_extension(subject_alt_name)?;
    builder.sign(&issuer.key, MessageDigest::sha256())?;

    Ok(Issuer {
        cert: builder.build(),
        key,
    })
}

pub fn write_pem(dir: &Path, file_name: &str, cert: &X509) -> anyhow::Result<PathBuf> {
    let path = dir.join(file_name);
    std::fs::write(&path, cert.to_pem()?)?;
    Ok(path)
}

pub fn write_der(dir: &Path, file_name: &str, cert: &X509) -> anyhow::Result<PathBuf> {
    let path = dir.join(file_name);
    std::fs::write(&path, cert.to_der()?)?;
    Ok(path)
}

/// Create a hierarchy named `name` and write each certificate to its own PEM file.
///
/// The chain is `{name} Intermediate`, then `extra` cross intermediates, then `{name} Root`.
/// Each certificate is issued by the one after it.
pub fn write_chain(dir: &Path, name: &str, extra: usize) -> anyhow::Result<ChainFiles> {
    let root = root(&format!("{name} Root"))?;
    let mut middle = Vec::with_capacity(extra);
    for index in 0..extra {
        let parent = middle.last().unwrap_or(&root);
        let cross = intermediate(&format!("{name} Cross Intermediate {index}"), parent)?;
        middle.push(cross);
    }
    let issuing = intermediate(
        &format!("{name} Intermediate"),
        middle.last().unwrap_or(&root),
    )?;

    let mut paths = vec![write_pem(
        dir,
        &format!("{name}-intermediate.pem"),
        &issuing.cert,
    )?];
    for (index, cross) in middle.iter().enumerate().rev() {
        paths.push(write_pem(dir, &format!("{name}-cross-{index}.pem"), &cross.cert)?);
    }
    paths.push(write_pem(dir, &format!("{name}-root.pem"), &root.cert)?);

    Ok(ChainFiles {
        root,
        intermediate: issuing,
        paths,
    })
}
