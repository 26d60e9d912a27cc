//! Worker pool and admission logic.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{AllManagerJobs, Job, JobManagerError, JobPosition};
use crate::metrics;

struct JobSets<J> {
    working: BTreeMap<usize, Option<J>>,
    waiting: Vec<J>,
}

/// State shared between the manager handle and its workers.
struct Shared<J> {
    label: String,
    jobs: RwLock<JobSets<J>>,
    high_rx: tokio::sync::Mutex<UnboundedReceiver<J>>,
    low_rx: tokio::sync::Mutex<UnboundedReceiver<J>>,
    shutdown: CancellationToken,
}

/// Priority job manager with a fixed worker pool.
///
/// Workers are spawned on construction, so `new` must be called from within
/// a tokio runtime. They run until the shutdown token is cancelled or the
/// manager is dropped.
pub struct JobManager<J: Job> {
    shared: Arc<Shared<J>>,
    high_tx: UnboundedSender<J>,
    low_tx: UnboundedSender<J>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: Job> JobManager<J> {
    /// Create a manager and start `worker_count` workers.
    ///
    /// `label` names the manager in logs and metrics (e.g. "fulfillment").
    pub fn new(
        label: impl Into<String>,
        worker_count: usize,
        shutdown: CancellationToken,
    ) -> Result<Self, JobManagerError> {
        if worker_count == 0 {
            return Err(JobManagerError::InvalidWorkerCount);
        }

        let label = label.into();
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            label: label.clone(),
            jobs: RwLock::new(JobSets {
                working: (0..worker_count).map(|id| (id, None)).collect(),
                waiting: Vec::new(),
            }),
            high_rx: tokio::sync::Mutex::new(high_rx),
            low_rx: tokio::sync::Mutex::new(low_rx),
            shutdown,
        });

        let workers = (0..worker_count)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                tokio::spawn(shared.worker_loop(worker_id))
            })
            .collect();

        info!("Job manager {} started with {} workers", label, worker_count);

        Ok(Self {
            shared,
            high_tx,
            low_tx,
            workers: Mutex::new(workers),
        })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn worker_count(&self) -> usize {
        self.shared.read_jobs().working.len()
    }

    /// Admit a job.
    ///
    /// Never waits for a free worker: the job is recorded as waiting and
    /// handed to the matching priority queue.
    pub fn add_job(&self, job: J) -> Result<(), JobManagerError> {
        let label = self.shared.label.as_str();

        if job.is_empty() {
            metrics::JOBS_REJECTED
                .with_label_values(&[label, "empty"])
                .inc();
            return Err(JobManagerError::EmptyJob);
        }

        if self.shared.shutdown.is_cancelled() {
            metrics::JOBS_REJECTED
                .with_label_values(&[label, "shutdown"])
                .inc();
            return Err(JobManagerError::ShuttingDown);
        }

        {
            let mut jobs = self.shared.write_jobs();
            let duplicate = jobs.working.values().flatten().any(|w| w.same_as(&job))
                || jobs.waiting.iter().any(|w| w.same_as(&job));
            if duplicate {
                metrics::JOBS_REJECTED
                    .with_label_values(&[label, "duplicate"])
                    .inc();
                return Err(JobManagerError::DuplicateJob(job.description()));
            }
            jobs.waiting.push(job.clone());
        }

        let high_priority = job.is_high_priority();
        let description = job.description();
        let queue = if high_priority {
            &self.high_tx
        } else {
            &self.low_tx
        };

        if let Err(mpsc::error::SendError(job)) = queue.send(job) {
            let mut jobs = self.shared.write_jobs();
            jobs.waiting.retain(|w| !w.same_as(&job));
            return Err(JobManagerError::ShuttingDown);
        }

        metrics::JOBS_ADMITTED.with_label_values(&[label]).inc();
        debug!(
            "Job manager {} queued job (high priority: {}): {}",
            label, high_priority, description
        );
        Ok(())
    }

    /// Locate a job by identity.
    pub fn job_exists(&self, job: &J) -> Option<JobPosition> {
        let jobs = self.shared.read_jobs();

        let working = jobs.working.iter().find_map(|(worker_id, current)| {
            current
                .as_ref()
                .filter(|current| current.same_as(job))
                .map(|_| JobPosition::Working(*worker_id))
        });

        working.or_else(|| {
            jobs.waiting
                .iter()
                .position(|w| w.same_as(job))
                .map(JobPosition::Waiting)
        })
    }

    /// Copy of the working and waiting sets.
    pub fn all_current_jobs(&self) -> AllManagerJobs<J> {
        let jobs = self.shared.read_jobs();
        AllManagerJobs {
            working: jobs.working.clone(),
            waiting: jobs.waiting.clone(),
        }
    }

    /// Wait for every worker to exit. Only returns once shutdown has been
    /// requested and in-flight jobs have finished.
    pub async fn wait_for_workers(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            workers.drain(..).collect()
        };

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Worker of job manager {} ended abnormally: {}", self.shared.label, e);
            }
        }
    }
}

impl<J: Job> Shared<J> {
    fn read_jobs(&self) -> RwLockReadGuard<'_, JobSets<J>> {
        self.jobs.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, JobSets<J>> {
        self.jobs.write().unwrap_or_else(|p| p.into_inner())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("Job manager {} started worker {}", self.label, worker_id);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                job = receive(&self.high_rx) => job.map(|job| (job, true)),
                job = receive(&self.low_rx) => job.map(|job| (job, false)),
            };

            let Some((job, high_priority)) = next else {
                break;
            };

            if !high_priority {
                // High priority jobs queued meanwhile go ahead of the low job
                // this worker already holds.
                while let Some(high_job) = self.try_receive_high() {
                    self.do_job(high_job, worker_id).await;
                }
            }

            self.do_job(job, worker_id).await;
        }

        debug!("Job manager {} stopped worker {}", self.label, worker_id);
    }

    /// Non-blocking poll of the high priority queue. If another worker is
    /// parked on it, that worker will take whatever arrives.
    fn try_receive_high(&self) -> Option<J> {
        let mut rx = self.high_rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    async fn do_job(&self, job: J, worker_id: usize) {
        {
            let mut jobs = self.write_jobs();
            if let Some(index) = jobs.waiting.iter().position(|w| w.same_as(&job)) {
                jobs.waiting.remove(index);
            }
            jobs.working.insert(worker_id, Some(job.clone()));
        }

        let description = job.description();
        info!(
            "Job manager {} worker {} starting job: {}",
            self.label, worker_id, description
        );

        job.run(worker_id).await;

        self.write_jobs().working.insert(worker_id, None);
        metrics::JOBS_COMPLETED
            .with_label_values(&[self.label.as_str()])
            .inc();
        info!(
            "Job manager {} worker {} finished job: {}",
            self.label, worker_id, description
        );
    }
}

async fn receive<J>(rx: &tokio::sync::Mutex<UnboundedReceiver<J>>) -> Option<J> {
    rx.lock().await.recv().await
}
