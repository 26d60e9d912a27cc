use thiserror::Error;

use crate::acme::{AcmeError, CertificateParseError, OrderStatus};
use crate::job_manager::JobManagerError;
use crate::order::StoreError;
use crate::post_process::PostProcessError;

/// Error type for order fulfillment and placement.
#[derive(Debug, Error)]
pub enum FulfillmentError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),

    #[error(transparent)]
    JobManager(#[from] JobManagerError),

    #[error("Post-processing setup failed: {0}")]
    PostProcess(#[from] PostProcessError),

    #[error("Order {order_id} is already {status}")]
    AlreadyFinal { order_id: i64, status: OrderStatus },

    #[error("Order {0} no longer exists on the ACME server")]
    OrderDiscarded(i64),

    #[error("Order {order_id} has unexpected status {status}")]
    UnexpectedStatus { order_id: i64, status: OrderStatus },

    #[error("Failed to parse downloaded certificate: {0}")]
    Certificate(#[from] CertificateParseError),

    #[error("Shutdown requested")]
    Shutdown,
}
