//! Serializable views of the job managers for monitoring.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::acme::OrderStatus;
use crate::job_manager::{AllManagerJobs, Job};
use crate::order::{Order, OrderStore, StoreError};
use crate::post_process::PostProcessJob;

/// A job that works on one stored order.
pub trait QueuedOrderJob: Job {
    fn order_id(&self) -> i64;
    fn added_to_queue(&self) -> DateTime<Utc>;
}

impl QueuedOrderJob for PostProcessJob {
    fn order_id(&self) -> i64 {
        PostProcessJob::order_id(self)
    }

    fn added_to_queue(&self) -> DateTime<Utc> {
        PostProcessJob::added_to_queue(self)
    }
}

/// One job as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Unix seconds.
    pub added_to_queue: i64,
    pub high_priority: bool,
    pub order_id: i64,
    pub certificate_id: i64,
    pub certificate_name: String,
    pub status: OrderStatus,
}

/// Working and waiting jobs of one manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkStatus {
    /// Keyed by worker id; `None` for an idle worker.
    pub jobs_working: BTreeMap<usize, Option<JobSummary>>,
    pub jobs_waiting: Vec<JobSummary>,
}

/// Build a [`WorkStatus`] from a manager snapshot. Jobs whose order can no
/// longer be loaded are left out.
pub fn work_status<J: QueuedOrderJob>(
    store: &dyn OrderStore,
    jobs: &AllManagerJobs<J>,
) -> Result<WorkStatus, StoreError> {
    let mut ids: Vec<i64> = jobs
        .working
        .values()
        .flatten()
        .chain(jobs.waiting.iter())
        .map(|job| job.order_id())
        .collect();
    ids.sort_unstable();
    ids.dedup();

    let orders: HashMap<i64, Order> = store
        .get_orders(&ids)?
        .into_iter()
        .map(|order| (order.id, order))
        .collect();

    let summarize = |job: &J| {
        orders.get(&job.order_id()).map(|order| JobSummary {
            added_to_queue: job.added_to_queue().timestamp(),
            high_priority: job.is_high_priority(),
            order_id: order.id,
            certificate_id: order.certificate.id,
            certificate_name: order.certificate.name.clone(),
            status: order.status,
        })
    };

    Ok(WorkStatus {
        jobs_working: jobs
            .working
            .iter()
            .map(|(worker_id, job)| (*worker_id, job.as_ref().and_then(&summarize)))
            .collect(),
        jobs_waiting: jobs.waiting.iter().filter_map(&summarize).collect(),
    })
}
