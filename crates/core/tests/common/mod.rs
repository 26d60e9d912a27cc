//! Shared harness for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use certhaven_core::acme::{leaf_validity, OrderStatus};
use certhaven_core::config::{BackoffConfig, Config};
use certhaven_core::order::{Certificate, Order, OrderStore, PostProcessingSettings, SqliteOrderStore};
use certhaven_core::post_process::PostProcessor;
use certhaven_core::testing::{
    fixtures, MockAcmeProvider, MockAcmeService, MockAuthorizations, MockCsrBuilder,
};
use certhaven_core::OrderService;

/// Config with short waits.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.fulfillment.workers = 2;
    config.fulfillment.finalize_settle_ms = 10;
    config.fulfillment.backoff = BackoffConfig {
        initial_interval_ms: 10,
        multiplier: 1.4,
        randomization_factor: 0.4,
        max_interval_ms: 50,
    };
    config
}

/// Leaf certificate for `example.com`, issued by a throwaway CA so it
/// carries an authority key identifier.
pub fn leaf_pem(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> String {
    let ca_key = KeyPair::generate().expect("Failed to generate CA key");
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("Failed to sign CA");

    let mut params = CertificateParams::new(vec!["example.com".to_string()]).expect("params");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "example.com");
    params.distinguished_name = dn;
    params.not_before =
        time::OffsetDateTime::from_unix_timestamp(not_before.timestamp()).expect("not_before");
    params.not_after =
        time::OffsetDateTime::from_unix_timestamp(not_after.timestamp()).expect("not_after");
    params.use_authority_key_identifier_extension = true;

    let leaf_key = KeyPair::generate().expect("Failed to generate leaf key");
    params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("Failed to sign leaf")
        .pem()
}

/// Test helper wiring an [`OrderService`] to a temp-dir store and mocks.
pub struct TestHarness {
    pub store: Arc<SqliteOrderStore>,
    pub acme: Arc<MockAcmeService>,
    pub authorizations: Arc<MockAuthorizations>,
    pub csr: Arc<MockCsrBuilder>,
    pub service: Arc<OrderService>,
    pub shutdown: CancellationToken,
    pub config: Config,
    next_location: AtomicU64,
    _temp_dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(fast_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let store = Arc::new(SqliteOrderStore::new(&db_path).expect("Failed to create store"));
        let acme = Arc::new(MockAcmeService::new());
        let authorizations = Arc::new(MockAuthorizations::new());
        let csr = Arc::new(MockCsrBuilder::new());
        let shutdown = CancellationToken::new();

        let post_processor = PostProcessor::with_shell(
            &config.post_processing,
            Arc::clone(&store) as Arc<dyn OrderStore>,
            Some(PathBuf::from("/bin/sh")),
            shutdown.clone(),
        )
        .expect("Failed to create post processor");

        let service = OrderService::with_post_processor(
            &config,
            Arc::clone(&store) as Arc<dyn OrderStore>,
            Arc::new(MockAcmeProvider::new(Arc::clone(&acme))),
            Arc::clone(&authorizations) as _,
            Arc::clone(&csr) as _,
            Arc::new(post_processor),
            shutdown.clone(),
        )
        .expect("Failed to create order service");

        Self {
            store,
            acme,
            authorizations,
            csr,
            service: Arc::new(service),
            shutdown,
            config,
            next_location: AtomicU64::new(1000),
            _temp_dir: temp_dir,
        }
    }

    pub fn certificate(&self, name: &str) -> Certificate {
        self.certificate_with(name, PostProcessingSettings::default())
    }

    pub fn certificate_with(&self, name: &str, settings: PostProcessingSettings) -> Certificate {
        fixtures::seed_certificate(self.store.as_ref(), name, settings)
            .expect("Failed to seed certificate")
    }

    /// Store an order in `status` with a fresh location.
    pub fn order(&self, certificate_id: i64, status: OrderStatus) -> i64 {
        let n = self.next_location.fetch_add(1, Ordering::SeqCst);
        fixtures::seed_order(
            self.store.as_ref(),
            certificate_id,
            &format!("https://ca.test/order/{}", n),
            status,
        )
        .expect("Failed to seed order")
    }

    /// Store a valid order carrying `pem`, finalized with the certificate's key.
    pub fn issued_order(&self, certificate: &Certificate, pem: &str) -> i64 {
        let order_id = self.order(certificate.id, OrderStatus::Pending);
        let validity = leaf_validity(pem).expect("Failed to parse test certificate");
        self.store
            .update_finalized_key(order_id, certificate.key.id)
            .expect("Failed to set finalized key");
        self.store
            .update_order_cert(order_id, pem, &validity)
            .expect("Failed to store certificate");

        let location = self.get_order(order_id).location;
        let mut acme = fixtures::acme_order(&location, OrderStatus::Valid);
        acme.certificate = Some(format!("{}/cert", location));
        self.store
            .put_order_acme(order_id, &acme)
            .expect("Failed to mark order valid");
        order_id
    }

    pub fn get_order(&self, order_id: i64) -> Order {
        self.store
            .get_one_order(order_id)
            .expect("Failed to load order")
    }

    pub fn order_status(&self, order_id: i64) -> OrderStatus {
        self.get_order(order_id).status
    }

    /// Poll until the stored order reaches `expected` or `timeout` passes.
    pub async fn wait_for_status(
        &self,
        order_id: i64,
        expected: OrderStatus,
        timeout: Duration,
    ) -> bool {
        let start = tokio::time::Instant::now();
        let poll_interval = poll_interval(timeout);

        while start.elapsed() < timeout {
            if self.order_status(order_id) == expected {
                return true;
            }
            tokio::time::sleep(poll_interval).await;
        }
        false
    }

    /// Poll until both job managers have no queued or running work.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let start = tokio::time::Instant::now();
        let poll_interval = poll_interval(timeout);

        while start.elapsed() < timeout {
            if self.is_idle() {
                return true;
            }
            tokio::time::sleep(poll_interval).await;
        }
        false
    }

    /// Poll until the fulfillment job for `order_id` is with a worker.
    pub async fn wait_for_working(&self, order_id: i64, timeout: Duration) -> bool {
        let start = tokio::time::Instant::now();

        while start.elapsed() < timeout {
            let jobs = self.service.manager().all_current_jobs();
            if jobs
                .working
                .values()
                .flatten()
                .any(|job| job.order_id() == order_id)
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn is_idle(&self) -> bool {
        let fulfilling = self.service.manager().all_current_jobs();
        let post_processing = self.service.post_processor().all_current_jobs();

        fulfilling.waiting.is_empty()
            && fulfilling.working.values().all(Option::is_none)
            && post_processing.waiting.is_empty()
            && post_processing.working.values().all(Option::is_none)
    }

    /// Cancel the shutdown token and wait for the workers to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.service.wait_for_workers())
            .await
            .expect("Workers did not stop");
    }
}

fn poll_interval(timeout: Duration) -> Duration {
    (timeout / 200).max(Duration::from_millis(20))
}
