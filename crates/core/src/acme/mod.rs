//! ACME protocol types and the collaborator interfaces the engine drives.
//!
//! Wire-level concerns (JWS, nonces, challenge provisioning, CSR encoding)
//! live behind [`AcmeService`], [`AuthorizationFulfiller`] and [`CsrBuilder`].

mod cert;
mod error;
mod traits;
mod types;

pub use cert::{leaf_validity, renewal_identifier, ValidityWindow};
pub use error::{AcmeError, CertificateParseError};
pub use traits::{AcmeService, AcmeServiceProvider, AuthorizationFulfiller, CsrBuilder};
pub use types::{
    AccountKey, AcmeIdentifier, AcmeOrder, AcmeProblem, AcmeRenewalInfo, AuthorizationStatus,
    NewOrderRequest, OrderStatus, SuggestedWindow,
};
