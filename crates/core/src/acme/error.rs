use thiserror::Error;

/// Errors returned by ACME collaborators.
#[derive(Debug, Clone, Error)]
pub enum AcmeError {
    /// The server answered with an RFC 7807 problem document.
    #[error("ACME server returned {status} ({problem_type}): {detail}")]
    Problem {
        status: u16,
        problem_type: String,
        detail: String,
    },

    #[error("ACME request failed: {0}")]
    Transport(String),

    #[error("Malformed ACME response: {0}")]
    Malformed(String),

    #[error("Unknown ACME server: {0}")]
    UnknownServer(i64),

    #[error("Failed to build CSR: {0}")]
    Csr(String),

    #[error("Not supported by the ACME server: {0}")]
    Unsupported(String),
}

impl AcmeError {
    /// True for a 404 problem, which for an order means the CA discarded it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AcmeError::Problem { status: 404, .. })
    }
}

/// Errors reading a certificate returned by the CA.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertificateParseError {
    #[error("Invalid PEM: {0}")]
    Pem(String),

    #[error("Invalid X.509 certificate: {0}")]
    X509(String),

    #[error("Certificate validity is out of range")]
    InvalidValidity,

    #[error("Certificate has no authority key identifier")]
    MissingAuthorityKeyId,
}
