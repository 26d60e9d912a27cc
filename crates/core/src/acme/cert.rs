//! Leaf certificate helpers.
//!
//! Chains returned by the CA are PEM, leaf first. Only the first block is read.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use x509_parser::extensions::ParsedExtension;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::error::CertificateParseError;

/// Validity window of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Read the validity window of the leaf certificate in a PEM chain.
pub fn leaf_validity(pem_chain: &str) -> Result<ValidityWindow, CertificateParseError> {
    with_leaf(pem_chain, |cert| {
        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or(CertificateParseError::InvalidValidity)?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or(CertificateParseError::InvalidValidity)?;
        Ok(ValidityWindow {
            not_before,
            not_after,
        })
    })
}

/// ARI certificate identifier: `base64url(AKI keyIdentifier) "." base64url(serial)`.
pub fn renewal_identifier(pem_chain: &str) -> Result<String, CertificateParseError> {
    with_leaf(pem_chain, |cert| {
        let key_id = cert
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::AuthorityKeyIdentifier(aki) => {
                    aki.key_identifier.as_ref().map(|id| id.0.to_vec())
                }
                _ => None,
            })
            .ok_or(CertificateParseError::MissingAuthorityKeyId)?;

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(key_id),
            URL_SAFE_NO_PAD.encode(cert.raw_serial())
        ))
    })
}

fn with_leaf<T>(
    pem_chain: &str,
    f: impl FnOnce(&X509Certificate<'_>) -> Result<T, CertificateParseError>,
) -> Result<T, CertificateParseError> {
    let (_, pem) = parse_x509_pem(pem_chain.as_bytes())
        .map_err(|e| CertificateParseError::Pem(e.to_string()))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| CertificateParseError::X509(e.to_string()))?;
    f(&cert)
}
