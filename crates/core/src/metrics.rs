//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Job managers (admissions, rejections, completions)
//! - Order fulfillment (outcomes)
//! - Renewal (ARI fetches, renewal orders placed)
//! - Post-processing (script and remote agent runs)

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, Opts};

// =============================================================================
// Job Managers
// =============================================================================

/// Jobs admitted by manager.
pub static JOBS_ADMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("certhaven_jobs_admitted_total", "Total jobs admitted"),
        &["manager"], // "fulfillment", "post_processing"
    )
    .unwrap()
});

/// Jobs rejected at admission by manager and reason.
pub static JOBS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("certhaven_jobs_rejected_total", "Total jobs rejected"),
        &["manager", "reason"], // "duplicate", "empty", "shutdown"
    )
    .unwrap()
});

/// Jobs run to completion by manager.
pub static JOBS_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("certhaven_jobs_completed_total", "Total jobs completed"),
        &["manager"],
    )
    .unwrap()
});

// =============================================================================
// Order Fulfillment
// =============================================================================

/// Fulfillment runs by outcome.
pub static ORDERS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "certhaven_orders_finished_total",
            "Total order fulfillment runs by outcome",
        ),
        &["outcome"], // "valid", "invalid", "timed_out", "aborted", "not_found"
    )
    .unwrap()
});

// =============================================================================
// Renewal
// =============================================================================

/// ARI fetches by result.
pub static ARI_FETCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("certhaven_ari_fetches_total", "Total ARI fetches"),
        &["result"], // "success", "failure"
    )
    .unwrap()
});

/// New orders placed by the renewal scheduler.
pub static RENEWAL_ORDERS_PLACED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "certhaven_renewal_orders_placed_total",
        "Total new orders placed for renewal",
    )
    .unwrap()
});

// =============================================================================
// Post-Processing
// =============================================================================

/// Post-processing runs by mechanism and result.
pub static POST_PROCESSING_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "certhaven_post_processing_runs_total",
            "Total post-processing runs",
        ),
        &["mechanism", "result"], // "script"/"client", "success"/"failure"
    )
    .unwrap()
});

/// Get all metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Job managers
        Box::new(JOBS_ADMITTED.clone()),
        Box::new(JOBS_REJECTED.clone()),
        Box::new(JOBS_COMPLETED.clone()),
        // Fulfillment
        Box::new(ORDERS_FINISHED.clone()),
        // Renewal
        Box::new(ARI_FETCHES.clone()),
        Box::new(RENEWAL_ORDERS_PLACED.clone()),
        // Post-processing
        Box::new(POST_PROCESSING_RUNS.clone()),
    ]
}
