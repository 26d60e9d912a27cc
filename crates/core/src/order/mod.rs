//! Certificates, their ACME orders, and persistence.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteOrderStore;
pub use store::{NewAcmeAccount, NewCertificate, NewPrivateKey, OrderStore, StoreError};
pub use types::{AcmeAccount, Certificate, Order, PostProcessingSettings, PrivateKey};
