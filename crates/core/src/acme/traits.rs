use std::sync::Arc;

use async_trait::async_trait;

use super::error::AcmeError;
use super::types::{
    AccountKey, AcmeOrder, AcmeRenewalInfo, AuthorizationStatus, NewOrderRequest,
};
use crate::order::Certificate;

/// Client for one ACME directory.
///
/// Implementations take care of JWS signing, nonces and retries on
/// `badNonce`. Every call that can fail with an HTTP status returns
/// [`AcmeError::Problem`] carrying it.
#[async_trait]
pub trait AcmeService: Send + Sync {
    /// Place a new order. The returned order has `location` set.
    async fn new_order(
        &self,
        request: &NewOrderRequest,
        account: &AccountKey,
    ) -> Result<AcmeOrder, AcmeError>;

    /// Fetch the current state of an order.
    async fn get_order(&self, location: &str, account: &AccountKey)
        -> Result<AcmeOrder, AcmeError>;

    /// Submit the CSR to the order's finalize URL.
    async fn finalize_order(
        &self,
        finalize_url: &str,
        csr_der: &[u8],
        account: &AccountKey,
    ) -> Result<AcmeOrder, AcmeError>;

    /// Download the PEM chain, leaf first. When `preferred_root_cn` is set
    /// and the server offers an alternate chain ending in that root, the
    /// alternate is returned.
    async fn download_certificate(
        &self,
        certificate_url: &str,
        account: &AccountKey,
        preferred_root_cn: Option<&str>,
    ) -> Result<String, AcmeError>;

    /// Whether the directory advertises `renewalInfo`.
    fn supports_ari(&self) -> bool;

    /// Fetch renewal information for a certificate.
    async fn get_renewal_info(&self, cert_pem: &str) -> Result<AcmeRenewalInfo, AcmeError>;
}

/// Resolves the ACME service for a configured server.
pub trait AcmeServiceProvider: Send + Sync {
    fn acme_service(&self, acme_server_id: i64) -> Result<Arc<dyn AcmeService>, AcmeError>;
}

/// Completes the challenges of a set of authorizations.
#[async_trait]
pub trait AuthorizationFulfiller: Send + Sync {
    /// Returns `Valid` only when every authorization ended up valid.
    async fn fulfill_auths(
        &self,
        authorization_urls: &[String],
        account: &AccountKey,
        service: &dyn AcmeService,
    ) -> Result<AuthorizationStatus, AcmeError>;
}

/// Builds the CSR submitted at finalization, signed with the certificate's
/// current key.
pub trait CsrBuilder: Send + Sync {
    fn make_csr_der(&self, certificate: &Certificate) -> Result<Vec<u8>, AcmeError>;
}
