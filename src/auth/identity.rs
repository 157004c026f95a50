//! Client identity from an mTLS peer certificate
//!
//! The identity is the local part of an RFC 822 subject alternative name in the
//! `mqtt.mtd` domain: a certificate carrying `client1@mqtt.mtd` belongs to `client1`.

use thiserror::Error;
use x509_parser::prelude::*;

pub const IDENTITY_DOMAIN_SUFFIX: &str = "@mqtt.mtd";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no peer certificate presented")]
    NoCertificate,

    #[error("certificate parse error: {0}")]
    Parse(String),

    #[error("no {IDENTITY_DOMAIN_SUFFIX} identity in certificate")]
    NoIdentity,
}

/// Extract the client name from a DER-encoded certificate
pub fn identity_from_der(der: &[u8]) -> Result<String, IdentityError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| IdentityError::Parse(e.to_string()))?;

    let san = cert
        .subject_alternative_name()
        .map_err(|e| IdentityError::Parse(e.to_string()))?
        .ok_or(IdentityError::NoIdentity)?;

    san.value
        .general_names
        .iter()
        .find_map(|name| match name {
            GeneralName::RFC822Name(email) => email
                .strip_suffix(IDENTITY_DOMAIN_SUFFIX)
                .filter(|local| !local.is_empty())
                .map(str::to_string),
            _ => None,
        })
        .ok_or(IdentityError::NoIdentity)
}

/// Identity of the first (leaf) certificate in a peer chain
pub fn identity_from_chain<C: AsRef<[u8]>>(chain: Option<&[C]>) -> Result<String, IdentityError> {
    let leaf = chain
        .and_then(|c| c.first())
        .ok_or(IdentityError::NoCertificate)?;
    identity_from_der(leaf.as_ref())
}
