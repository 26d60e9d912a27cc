//! Job trait and manager-level types.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// A unit of work admitted to a [`JobManager`](super::JobManager).
///
/// Jobs are cheap handles: cloning one must not duplicate the work it
/// describes. Identity for deduplication comes from [`Job::same_as`], not
/// from structural equality.
#[async_trait]
pub trait Job: Clone + Send + Sync + 'static {
    /// Log-friendly identity of the job.
    fn description(&self) -> String;

    fn is_high_priority(&self) -> bool;

    /// Logical identity comparison used to refuse duplicate admissions.
    fn same_as(&self, other: &Self) -> bool;

    /// True when the job carries no real identity and must not be admitted.
    fn is_empty(&self) -> bool {
        false
    }

    /// Execute the job. Outcomes are persisted by the job itself.
    async fn run(&self, worker_id: usize);
}

/// Where an admitted job currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPosition {
    /// Being executed by the given worker.
    Working(usize),
    /// Queued, at the given index of the waiting list.
    Waiting(usize),
}

/// Snapshot of a manager's jobs. Owned copies; mutating it has no effect on
/// the manager.
#[derive(Debug, Clone)]
pub struct AllManagerJobs<J> {
    /// One entry per worker, `None` when the worker is idle.
    pub working: BTreeMap<usize, Option<J>>,
    pub waiting: Vec<J>,
}

/// Job manager errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobManagerError {
    #[error("Job is already queued or being worked: {0}")]
    DuplicateJob(String),

    #[error("Job has no identity and cannot be queued")]
    EmptyJob,

    #[error("Job manager needs at least one worker")]
    InvalidWorkerCount,

    #[error("Job manager is shutting down")]
    ShuttingDown,
}
