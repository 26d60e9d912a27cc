//! ACME order fulfillment.
//!
//! [`OrderService`] owns the fulfillment job manager and the entry points
//! that feed it: queueing a stored order, placing a fresh order for a
//! certificate, and resuming orders left incomplete. Each queued
//! [`OrderFulfillJob`] drives one order through `pending`, `ready` and
//! `processing` until the server reports it `valid` or `invalid`.

mod backoff;
mod error;
mod job;
mod service;
mod status;

pub use backoff::AcmeBackoff;
pub use error::FulfillmentError;
pub use job::{FulfillOutcome, OrderFulfillJob, ReloadCallback, FULFILLMENT_LABEL};
pub use service::OrderService;
pub use status::{work_status, JobSummary, QueuedOrderJob, WorkStatus};
