use thiserror::Error;

use crate::acme::OrderStatus;
use crate::job_manager::JobManagerError;
use crate::order::StoreError;

/// Error type for post-processing.
#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    JobManager(#[from] JobManagerError),

    #[error("Order {order_id} is {status}, only valid orders are post-processed")]
    OrderNotValid { order_id: i64, status: OrderStatus },

    #[error("Certificate {certificate_id} has no post-processing configured")]
    NothingToDo { certificate_id: i64 },

    #[error("Order {0} has no certificate PEM")]
    MissingPem(i64),

    #[error("Order {0} has no finalized key")]
    MissingFinalizedKey(i64),

    #[error("Failed to read command file {path}: {source}")]
    CommandRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No default shell found to run script {0}")]
    NoDefaultShell(String),

    #[error("Failed to spawn {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Invalid client key: {0}")]
    InvalidClientKey(String),

    #[error("Payload encryption failed: {0}")]
    Encryption(String),

    #[error("Client request failed: {0}")]
    ClientRequest(String),

    #[error("Client returned status {0}")]
    ClientStatus(u16),
}
