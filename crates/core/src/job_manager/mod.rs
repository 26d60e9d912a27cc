//! Generic priority job manager.
//!
//! A fixed pool of workers consumes jobs from a high and a low priority
//! queue. Jobs are deduplicated by logical identity across the waiting and
//! working sets, so at most one job per identity is ever in flight.

mod manager;
mod types;

pub use manager::JobManager;
pub use types::{AllManagerJobs, Job, JobManagerError, JobPosition};
