//! Integration tests for the renewal scheduler.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use certhaven_core::acme::{
    renewal_identifier, AcmeError, AcmeIdentifier, AcmeRenewalInfo, OrderStatus, SuggestedWindow,
};
use certhaven_core::config::RenewalConfig;
use certhaven_core::order::Certificate;
use certhaven_core::renewal::{RenewalSweep, REMAINING_FRACTION, WINDOW_JITTER_SECS, WINDOW_SPAN};
use certhaven_core::testing::AcmeCall;
use certhaven_core::{OrderStore, RenewalInfo, RenewalScheduler};
use common::{leaf_pem, TestHarness};

/// Harness whose freshly placed orders fail fast, so renewal tests only
/// look at what the scheduler decided.
async fn renewal_harness() -> TestHarness {
    let harness = TestHarness::new().await;
    harness.acme.script_statuses([OrderStatus::Invalid]).await;
    harness
}

fn scheduler(harness: &TestHarness) -> RenewalScheduler {
    scheduler_with(harness, harness.config.renewal.clone())
}

fn scheduler_with(harness: &TestHarness, config: RenewalConfig) -> RenewalScheduler {
    RenewalScheduler::new(
        config,
        Arc::clone(&harness.service),
        harness.shutdown.clone(),
    )
}

/// Issue a certificate valid from `now - age` for `lifetime`.
fn issue(
    harness: &TestHarness,
    name: &str,
    age: ChronoDuration,
    lifetime: ChronoDuration,
) -> (Certificate, i64, String) {
    let now = Utc::now();
    let pem = leaf_pem(now - age, now - age + lifetime);
    let certificate = harness.certificate(name);
    let order_id = harness.issued_order(&certificate, &pem);
    (certificate, order_id, pem)
}

fn ari_response(start: DateTime<Utc>, end: DateTime<Utc>, retry_after_secs: Option<u64>) -> AcmeRenewalInfo {
    AcmeRenewalInfo {
        suggested_window: SuggestedWindow { start, end },
        explanation_url: Some("https://ca.test/docs/renewal".to_string()),
        retry_after_secs,
    }
}

#[tokio::test]
async fn test_due_certificate_gets_new_order() {
    let harness = renewal_harness().await;
    let (certificate, order_id, _) = issue(
        &harness,
        "web",
        ChronoDuration::days(80),
        ChronoDuration::days(90),
    );

    let sweep = scheduler(&harness).run_once().await;
    assert_eq!(
        sweep,
        RenewalSweep {
            resumed: 0,
            evaluated: 1,
            renewals_placed: 1,
        }
    );

    let requests = harness.acme.new_order_requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].identifiers,
        vec![
            AcmeIdentifier::dns("web.example.com"),
            AcmeIdentifier::dns("www.web.example.com"),
        ]
    );
    assert_eq!(requests[0].replaces, None);

    // The heuristic window is kept on the issued order.
    let order = harness.get_order(order_id);
    let info = order.renewal_info.expect("renewal info should be stored");
    let valid_from = order.valid_from.unwrap();
    let valid_to = order.valid_to.unwrap();
    let remaining = ChronoDuration::milliseconds(
        ((valid_to - valid_from).num_milliseconds() as f64 * REMAINING_FRACTION) as i64,
    );
    let expected_start = valid_to - remaining - WINDOW_SPAN;
    let offset = info.suggested_window.start - expected_start;
    assert!(offset >= ChronoDuration::zero());
    assert!(offset < ChronoDuration::seconds(WINDOW_JITTER_SECS));
    assert!(info.retry_after.is_none());

    let orders = harness.store.get_orders_by_cert(certificate.id).unwrap();
    assert_eq!(orders.len(), 2);

    assert!(harness.wait_for_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_fresh_certificate_not_renewed() {
    let harness = renewal_harness().await;
    let (certificate, order_id, _) = issue(
        &harness,
        "api",
        ChronoDuration::days(1),
        ChronoDuration::days(90),
    );

    let sweep = scheduler(&harness).run_once().await;
    assert_eq!(sweep.evaluated, 1);
    assert_eq!(sweep.renewals_placed, 0);

    assert!(harness.acme.new_order_requests().await.is_empty());
    assert_eq!(
        harness.store.get_orders_by_cert(certificate.id).unwrap().len(),
        1
    );
    assert!(harness.get_order(order_id).renewal_info.is_some());
}

#[tokio::test]
async fn test_ari_window_triggers_renewal_with_replaces() {
    let harness = renewal_harness().await;
    harness.acme.set_supports_ari(true);
    let now = Utc::now();
    harness
        .acme
        .set_renewal_info(Ok(ari_response(
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
            Some(3600),
        )))
        .await;

    // Far from its heuristic window: only the CA's window makes it due.
    let (_, order_id, pem) = issue(
        &harness,
        "mail",
        ChronoDuration::days(1),
        ChronoDuration::days(90),
    );

    let sweep = scheduler(&harness).run_once().await;
    assert_eq!(sweep.renewals_placed, 1);

    let requests = harness.acme.new_order_requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].replaces, Some(renewal_identifier(&pem).unwrap()));

    let info = harness
        .get_order(order_id)
        .renewal_info
        .expect("renewal info should be stored");
    assert_eq!(
        info.explanation_url.as_deref(),
        Some("https://ca.test/docs/renewal")
    );
    let retry_after = info.retry_after.expect("retry after should be stored");
    assert!(retry_after > now + ChronoDuration::minutes(59));
    assert!(retry_after < Utc::now() + ChronoDuration::minutes(61));

    assert!(harness.wait_for_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_ari_failure_falls_back_to_heuristic() {
    let harness = renewal_harness().await;
    harness.acme.set_supports_ari(true);

    let (_, order_id, _) = issue(
        &harness,
        "backup",
        ChronoDuration::days(80),
        ChronoDuration::days(90),
    );

    let sweep = scheduler(&harness).run_once().await;
    assert_eq!(sweep.renewals_placed, 1);

    let calls = harness.acme.calls().await;
    assert!(calls.iter().any(|call| matches!(call, AcmeCall::RenewalInfo)));

    let info = harness
        .get_order(order_id)
        .renewal_info
        .expect("heuristic info should be stored");
    assert!(info.explanation_url.is_none());
    assert!(info.retry_after.is_none());

    assert!(harness.wait_for_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_stored_info_respects_retry_after() {
    let harness = renewal_harness().await;
    harness.acme.set_supports_ari(true);
    let now = Utc::now();

    let (_, order_id, _) = issue(
        &harness,
        "cached",
        ChronoDuration::days(1),
        ChronoDuration::days(90),
    );
    let stored = RenewalInfo {
        suggested_window: SuggestedWindow {
            start: now + ChronoDuration::days(50),
            end: now + ChronoDuration::days(51),
        },
        explanation_url: None,
        retry_after: Some(now + ChronoDuration::days(1)),
    };
    harness.store.put_renewal_info(order_id, &stored).unwrap();

    let sweep = scheduler(&harness).run_once().await;
    assert_eq!(sweep.evaluated, 1);
    assert_eq!(sweep.renewals_placed, 0);

    let calls = harness.acme.calls().await;
    assert!(!calls.iter().any(|call| matches!(call, AcmeCall::RenewalInfo)));
    assert_eq!(harness.get_order(order_id).renewal_info, Some(stored));
}

#[tokio::test]
async fn test_ari_failure_keeps_stored_info() {
    let harness = renewal_harness().await;
    harness.acme.set_supports_ari(true);
    harness
        .acme
        .set_renewal_info(Err(AcmeError::Transport("connection refused".to_string())))
        .await;
    let now = Utc::now();

    let (_, order_id, _) = issue(
        &harness,
        "stale",
        ChronoDuration::days(1),
        ChronoDuration::days(90),
    );
    let stored = RenewalInfo {
        suggested_window: SuggestedWindow {
            start: now + ChronoDuration::days(40),
            end: now + ChronoDuration::days(42),
        },
        explanation_url: Some("https://ca.test/docs/renewal".to_string()),
        retry_after: Some(now - ChronoDuration::hours(1)),
    };
    harness.store.put_renewal_info(order_id, &stored).unwrap();

    let sweep = scheduler(&harness).run_once().await;
    assert_eq!(
        sweep,
        RenewalSweep {
            resumed: 0,
            evaluated: 1,
            renewals_placed: 0,
        }
    );

    let calls = harness.acme.calls().await;
    assert!(calls.iter().any(|call| matches!(call, AcmeCall::RenewalInfo)));
    assert_eq!(harness.get_order(order_id).renewal_info, Some(stored));
    assert!(harness.acme.new_order_requests().await.is_empty());
}

#[tokio::test]
async fn test_sweep_resumes_incomplete_orders() {
    let harness = renewal_harness().await;
    let certificate = harness.certificate("resume");
    let pending = harness.order(certificate.id, OrderStatus::Pending);
    let processing = harness.order(certificate.id, OrderStatus::Processing);

    let sweep = scheduler(&harness).run_once().await;
    assert_eq!(
        sweep,
        RenewalSweep {
            resumed: 2,
            evaluated: 0,
            renewals_placed: 0,
        }
    );

    assert!(harness.wait_for_idle(Duration::from_secs(5)).await);
    assert_eq!(harness.order_status(pending), OrderStatus::Invalid);
    assert_eq!(harness.order_status(processing), OrderStatus::Invalid);
}

#[tokio::test]
async fn test_scheduler_start_stop() {
    let harness = renewal_harness().await;
    issue(
        &harness,
        "loop",
        ChronoDuration::days(80),
        ChronoDuration::days(90),
    );

    let scheduler = scheduler_with(
        &harness,
        RenewalConfig {
            enabled: true,
            interval_secs: 3600,
            initial_delay_secs: 0,
            jitter_secs: 0,
        },
    );
    assert!(!scheduler.is_running());

    scheduler.start().await;
    assert!(scheduler.is_running());

    let start = tokio::time::Instant::now();
    while harness.acme.new_order_requests().await.is_empty() {
        assert!(start.elapsed() < Duration::from_secs(5), "no renewal placed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    scheduler.stop().await;
    assert!(!scheduler.is_running());
    assert_eq!(harness.acme.new_order_requests().await.len(), 1);
}

#[tokio::test]
async fn test_disabled_scheduler_does_not_start() {
    let harness = renewal_harness().await;
    let scheduler = scheduler_with(
        &harness,
        RenewalConfig {
            enabled: false,
            ..Default::default()
        },
    );

    scheduler.start().await;
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn test_scheduler_stops_on_shutdown() {
    let harness = renewal_harness().await;
    let scheduler = scheduler(&harness);

    scheduler.start().await;
    assert!(scheduler.is_running());

    harness.shutdown.cancel();
    let start = tokio::time::Instant::now();
    while scheduler.is_running() {
        assert!(start.elapsed() < Duration::from_secs(5), "loop did not stop");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
