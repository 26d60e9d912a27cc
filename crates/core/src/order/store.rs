//! Order storage trait and types.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::{Certificate, Order, PostProcessingSettings, PrivateKey};
use crate::acme::{AcmeOrder, ValidityWindow};
use crate::renewal::RenewalInfo;

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Request to store a private key.
#[derive(Debug, Clone)]
pub struct NewPrivateKey {
    pub name: String,
    pub pem: String,
    pub api_key: String,
}

/// Request to store an ACME account.
#[derive(Debug, Clone)]
pub struct NewAcmeAccount {
    pub name: String,
    pub acme_server_id: i64,
    pub kid: String,
    pub private_key_id: i64,
}

/// Request to store a certificate definition.
#[derive(Debug, Clone)]
pub struct NewCertificate {
    pub name: String,
    pub subject: String,
    pub subject_alt_names: Vec<String>,
    pub acme_account_id: i64,
    pub private_key_id: i64,
    pub preferred_root_cn: Option<String>,
    pub api_key: String,
    pub post_processing: PostProcessingSettings,
}

/// Trait for order storage backends.
pub trait OrderStore: Send + Sync {
    fn insert_private_key(&self, key: NewPrivateKey) -> Result<PrivateKey, StoreError>;

    /// Returns the new account id.
    fn insert_acme_account(&self, account: NewAcmeAccount) -> Result<i64, StoreError>;

    fn insert_certificate(&self, certificate: NewCertificate) -> Result<Certificate, StoreError>;

    fn get_one_certificate(&self, id: i64) -> Result<Certificate, StoreError>;

    fn get_one_order(&self, id: i64) -> Result<Order, StoreError>;

    /// Orders with the given ids. Unknown ids are skipped.
    fn get_orders(&self, ids: &[i64]) -> Result<Vec<Order>, StoreError>;

    /// Orders of a certificate, most recently created first.
    fn get_orders_by_cert(&self, certificate_id: i64) -> Result<Vec<Order>, StoreError>;

    /// Record an order just placed with the ACME server and return its id.
    /// Placing an order the server already knows (same location) refreshes
    /// the existing row.
    fn post_new_order(&self, certificate_id: i64, acme: &AcmeOrder) -> Result<i64, StoreError>;

    /// Overwrite the ACME-side fields with the server's latest view.
    fn put_order_acme(&self, order_id: i64, acme: &AcmeOrder) -> Result<(), StoreError>;

    /// Mark an order invalid without an ACME response to copy from.
    fn put_order_invalid(&self, order_id: i64) -> Result<(), StoreError>;

    fn update_finalized_key(&self, order_id: i64, key_id: i64) -> Result<(), StoreError>;

    fn update_order_cert(
        &self,
        order_id: i64,
        pem: &str,
        validity: &ValidityWindow,
    ) -> Result<(), StoreError>;

    fn update_cert_updated_time(&self, certificate_id: i64) -> Result<(), StoreError>;

    /// Per certificate, the valid, unrevoked, unexpired order with a PEM that
    /// expires last. Ties go to the newest order.
    fn get_all_valid_current_orders(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError>;

    /// Orders still `pending`, `ready` or `processing`.
    fn get_all_incomplete_order_ids(&self) -> Result<Vec<i64>, StoreError>;

    fn put_renewal_info(&self, order_id: i64, info: &RenewalInfo) -> Result<(), StoreError>;
}
