//! Post-processing of issued certificates.
//!
//! After an order becomes valid, a [`PostProcessJob`] may run the
//! certificate's script or binary and push the key and chain to a remote
//! install agent. Both mechanisms are best-effort and independent: a failure
//! in one is logged and does not stop the other or touch the order.

mod client;
mod env;
mod error;
mod job;
mod script;

pub use client::{install_url, notify_client, ClientPayload, InstallBundle, CLIENT_INSTALL_ROUTE};
pub use env::{EnvParams, PlaceholderValues};
pub use error::PostProcessError;
pub use job::{
    MechanismOutcome, PostProcessJob, PostProcessReport, PostProcessor, POST_PROCESSING_LABEL,
};
pub use script::{find_default_shell, run_command, LaunchMode};
