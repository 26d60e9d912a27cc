use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{install_url, notify_client, InstallBundle};
use super::env::{EnvParams, PlaceholderValues};
use super::error::PostProcessError;
use super::script::{find_default_shell, run_command};
use crate::acme::OrderStatus;
use crate::config::PostProcessingConfig;
use crate::job_manager::{AllManagerJobs, Job, JobManager};
use crate::metrics;
use crate::order::{Order, OrderStore};

/// Manager label used in logs and metrics.
pub const POST_PROCESSING_LABEL: &str = "post_processing";

/// Result of one mechanism.
#[derive(Debug)]
pub enum MechanismOutcome {
    /// Nothing configured for this mechanism.
    Skipped,
    Succeeded,
    Failed(PostProcessError),
}

impl MechanismOutcome {
    fn from_result(result: Result<(), PostProcessError>) -> Self {
        match result {
            Ok(()) => MechanismOutcome::Succeeded,
            Err(e) => MechanismOutcome::Failed(e),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, MechanismOutcome::Failed(_))
    }

    fn metric_label(&self) -> &'static str {
        match self {
            MechanismOutcome::Skipped => "skipped",
            MechanismOutcome::Succeeded => "success",
            MechanismOutcome::Failed(_) => "failure",
        }
    }
}

/// What a post-processing run did. The two mechanisms are independent.
#[derive(Debug)]
pub struct PostProcessReport {
    pub order_id: i64,
    pub script: MechanismOutcome,
    pub client: MechanismOutcome,
}

/// Dependencies shared by every post-processing job.
struct PostProcessContext {
    store: Arc<dyn OrderStore>,
    http: reqwest::Client,
    client_port: u16,
    default_shell: Option<PathBuf>,
}

impl PostProcessContext {
    async fn execute(
        &self,
        order_id: i64,
        worker_id: usize,
    ) -> Result<PostProcessReport, PostProcessError> {
        let order = self.store.get_one_order(order_id)?;

        // Client first, then the script. Neither stops the other.
        let client = self.notify_client(&order, worker_id).await;
        let script = self.run_script(&order, worker_id).await;

        for (mechanism, outcome) in [("client", &client), ("script", &script)] {
            metrics::POST_PROCESSING_RUNS
                .with_label_values(&[mechanism, outcome.metric_label()])
                .inc();
        }

        Ok(PostProcessReport {
            order_id,
            script,
            client,
        })
    }

    async fn run_script(&self, order: &Order, worker_id: usize) -> MechanismOutcome {
        let certificate = &order.certificate;
        let Some(command) = certificate
            .post_processing
            .command
            .as_deref()
            .filter(|_| certificate.post_processing.has_command())
        else {
            debug!(
                "Post processing worker {} found no command for order {} (certificate {})",
                worker_id, order.id, certificate.name
            );
            return MechanismOutcome::Skipped;
        };

        info!(
            "Post processing worker {} running command for order {} (certificate {})",
            worker_id, order.id, certificate.name
        );

        let result = async {
            let pem = order
                .pem
                .as_deref()
                .ok_or(PostProcessError::MissingPem(order.id))?;
            let key = order
                .finalized_key
                .as_ref()
                .ok_or(PostProcessError::MissingFinalizedKey(order.id))?;

            let (params, invalid) = EnvParams::parse(&certificate.post_processing.environment);
            if !invalid.is_empty() {
                error!(
                    "Post processing worker {} skipping malformed environment params for order {}: {:?}",
                    worker_id, order.id, invalid
                );
            }
            let env = params.resolve(&PlaceholderValues {
                key,
                certificate,
                certificate_pem: pem,
            });

            let stdout = run_command(command, &env, self.default_shell.as_deref()).await?;
            debug!(
                "Post processing worker {} command output for order {}: {}",
                worker_id, order.id, stdout
            );
            Ok::<(), PostProcessError>(())
        }
        .await;

        match &result {
            Ok(()) => info!(
                "Post processing worker {} completed command for order {}",
                worker_id, order.id
            ),
            Err(e) => error!(
                "Post processing worker {} command failed for order {}: {}",
                worker_id, order.id, e
            ),
        }
        MechanismOutcome::from_result(result)
    }

    async fn notify_client(&self, order: &Order, worker_id: usize) -> MechanismOutcome {
        let settings = &order.certificate.post_processing;
        let (Some(address), Some(key_b64)) = (
            settings.client_address.as_deref(),
            settings.client_key_b64.as_deref(),
        ) else {
            debug!(
                "Post processing worker {} found no client for order {} (certificate {})",
                worker_id, order.id, order.certificate.name
            );
            return MechanismOutcome::Skipped;
        };
        if address.is_empty() || key_b64.is_empty() {
            return MechanismOutcome::Skipped;
        }

        info!(
            "Post processing worker {} notifying client for order {}: {}",
            worker_id, order.id, address
        );

        let result = async {
            let cert_pem = order.pem.clone().ok_or(PostProcessError::MissingPem(order.id))?;
            let key = order
                .finalized_key
                .as_ref()
                .ok_or(PostProcessError::MissingFinalizedKey(order.id))?;
            let bundle = InstallBundle {
                key_pem: key.pem.clone(),
                cert_pem,
            };
            notify_client(
                &self.http,
                &install_url(address, self.client_port),
                key_b64,
                &bundle,
            )
            .await
        }
        .await;

        match &result {
            Ok(()) => info!(
                "Post processing worker {} notified client for order {}",
                worker_id, order.id
            ),
            Err(e) => error!(
                "Post processing worker {} failed to notify client for order {} ({}): {}",
                worker_id, order.id, address, e
            ),
        }
        MechanismOutcome::from_result(result)
    }
}

/// Post-processing of one valid order.
#[derive(Clone)]
pub struct PostProcessJob {
    ctx: Arc<PostProcessContext>,
    order_id: i64,
    certificate_id: i64,
    high_priority: bool,
    added_to_queue: DateTime<Utc>,
}

impl PostProcessJob {
    pub fn order_id(&self) -> i64 {
        self.order_id
    }

    pub fn certificate_id(&self) -> i64 {
        self.certificate_id
    }

    pub fn added_to_queue(&self) -> DateTime<Utc> {
        self.added_to_queue
    }
}

impl std::fmt::Debug for PostProcessJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessJob")
            .field("order_id", &self.order_id)
            .field("certificate_id", &self.certificate_id)
            .field("high_priority", &self.high_priority)
            .finish()
    }
}

#[async_trait]
impl Job for PostProcessJob {
    fn description(&self) -> String {
        format!(
            "certificate id: {}, order id: {}",
            self.certificate_id, self.order_id
        )
    }

    fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    /// Same order or same certificate, so a certificate never has two
    /// overlapping runs even across orders.
    fn same_as(&self, other: &Self) -> bool {
        self.order_id == other.order_id || self.certificate_id == other.certificate_id
    }

    fn is_empty(&self) -> bool {
        self.order_id <= 0 || self.certificate_id <= 0
    }

    async fn run(&self, worker_id: usize) {
        info!(
            "Post processing worker {} starting job ({})",
            worker_id,
            self.description()
        );

        match self.ctx.execute(self.order_id, worker_id).await {
            Ok(report) => {
                if report.script.is_failed() || report.client.is_failed() {
                    warn!(
                        "Post processing worker {} finished order {} with errors",
                        worker_id, self.order_id
                    );
                } else {
                    info!(
                        "Post processing worker {} finished order {}",
                        worker_id, self.order_id
                    );
                }
            }
            Err(e) => error!(
                "Post processing worker {} failed to load order {}: {}",
                worker_id, self.order_id, e
            ),
        }
    }
}

/// Owns the post-processing job manager.
pub struct PostProcessor {
    ctx: Arc<PostProcessContext>,
    manager: JobManager<PostProcessJob>,
}

impl PostProcessor {
    /// Create the processor, locating the default shell on `PATH`.
    pub fn new(
        config: &PostProcessingConfig,
        store: Arc<dyn OrderStore>,
        shutdown: CancellationToken,
    ) -> Result<Self, PostProcessError> {
        let shell = find_default_shell();
        match &shell {
            Some(path) => debug!("Post processing default shell: {}", path.display()),
            None => warn!("No default shell found, post processing scripts without a shebang will fail"),
        }
        Self::with_shell(config, store, shell, shutdown)
    }

    /// Create the processor with an explicit default shell.
    pub fn with_shell(
        config: &PostProcessingConfig,
        store: Arc<dyn OrderStore>,
        default_shell: Option<PathBuf>,
        shutdown: CancellationToken,
    ) -> Result<Self, PostProcessError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.client_timeout_secs))
            .build()
            .map_err(|e| PostProcessError::ClientRequest(e.to_string()))?;

        let manager = JobManager::new(POST_PROCESSING_LABEL, config.workers, shutdown)?;

        Ok(Self {
            ctx: Arc::new(PostProcessContext {
                store,
                http,
                client_port: config.client_port,
                default_shell,
            }),
            manager,
        })
    }

    /// Build a job for a valid order with something to run.
    pub fn make_job(
        &self,
        order_id: i64,
        high_priority: bool,
    ) -> Result<PostProcessJob, PostProcessError> {
        let order = self.ctx.store.get_one_order(order_id)?;

        if order.status != OrderStatus::Valid {
            return Err(PostProcessError::OrderNotValid {
                order_id,
                status: order.status,
            });
        }
        if !order.certificate.has_post_processing_to_do() {
            return Err(PostProcessError::NothingToDo {
                certificate_id: order.certificate.id,
            });
        }

        Ok(PostProcessJob {
            ctx: Arc::clone(&self.ctx),
            order_id,
            certificate_id: order.certificate.id,
            high_priority,
            added_to_queue: Utc::now(),
        })
    }

    /// Queue post-processing for an order.
    pub fn post_process(&self, order_id: i64, high_priority: bool) -> Result<(), PostProcessError> {
        let job = self.make_job(order_id, high_priority)?;
        self.manager.add_job(job)?;
        Ok(())
    }

    /// Run both mechanisms for an order now, outside the job manager.
    pub async fn execute(&self, order_id: i64) -> Result<PostProcessReport, PostProcessError> {
        self.ctx.execute(order_id, 0).await
    }

    pub fn manager(&self) -> &JobManager<PostProcessJob> {
        &self.manager
    }

    pub fn all_current_jobs(&self) -> AllManagerJobs<PostProcessJob> {
        self.manager.all_current_jobs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{AcmeOrder, ValidityWindow};
    use crate::order::{
        NewAcmeAccount, NewCertificate, NewPrivateKey, PostProcessingSettings, SqliteOrderStore,
    };

    fn seed(store: &SqliteOrderStore, settings: PostProcessingSettings) -> (i64, i64) {
        let key = store
            .insert_private_key(NewPrivateKey {
                name: "web-key".to_string(),
                pem: "KEY PEM".to_string(),
                api_key: "key-api".to_string(),
            })
            .unwrap();
        let account_id = store
            .insert_acme_account(NewAcmeAccount {
                name: "acct".to_string(),
                acme_server_id: 1,
                kid: "https://ca.test/acct/1".to_string(),
                private_key_id: key.id,
            })
            .unwrap();
        let certificate = store
            .insert_certificate(NewCertificate {
                name: "web".to_string(),
                subject: "example.com".to_string(),
                subject_alt_names: vec![],
                acme_account_id: account_id,
                private_key_id: key.id,
                preferred_root_cn: None,
                api_key: "cert-api".to_string(),
                post_processing: settings,
            })
            .unwrap();
        let order_id = store
            .post_new_order(
                certificate.id,
                &AcmeOrder {
                    location: "https://ca.test/order/1".to_string(),
                    status: OrderStatus::Pending,
                    expires: None,
                    identifiers: vec![],
                    authorizations: vec![],
                    finalize: "https://ca.test/finalize/1".to_string(),
                    certificate: None,
                    error: None,
                },
            )
            .unwrap();
        (certificate.id, order_id)
    }

    fn make_valid(store: &SqliteOrderStore, order_id: i64, key_id: i64) {
        let now = Utc::now();
        store.update_finalized_key(order_id, key_id).unwrap();
        store
            .update_order_cert(
                order_id,
                "CERT PEM",
                &ValidityWindow {
                    not_before: now,
                    not_after: now + chrono::Duration::days(90),
                },
            )
            .unwrap();
        let acme = AcmeOrder {
            location: "https://ca.test/order/1".to_string(),
            status: OrderStatus::Valid,
            expires: None,
            identifiers: vec![],
            authorizations: vec![],
            finalize: "https://ca.test/finalize/1".to_string(),
            certificate: Some("https://ca.test/cert/1".to_string()),
            error: None,
        };
        store.put_order_acme(order_id, &acme).unwrap();
    }

    fn processor(store: Arc<SqliteOrderStore>) -> PostProcessor {
        PostProcessor::with_shell(
            &PostProcessingConfig::default(),
            store,
            Some(PathBuf::from("/bin/sh")),
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn job(order_id: i64, certificate_id: i64, ctx: &Arc<PostProcessContext>) -> PostProcessJob {
        PostProcessJob {
            ctx: Arc::clone(ctx),
            order_id,
            certificate_id,
            high_priority: false,
            added_to_queue: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_same_as_matches_order_or_certificate() {
        let store = Arc::new(SqliteOrderStore::in_memory().unwrap());
        let processor = processor(store);
        let ctx = &processor.ctx;

        let a = job(1, 10, ctx);
        assert!(a.same_as(&job(1, 11, ctx)));
        assert!(a.same_as(&job(2, 10, ctx)));
        assert!(!a.same_as(&job(2, 11, ctx)));
        assert!(job(0, 10, ctx).is_empty());
        assert_eq!(a.description(), "certificate id: 10, order id: 1");
    }

    #[tokio::test]
    async fn test_make_job_requires_valid_order() {
        let store = Arc::new(SqliteOrderStore::in_memory().unwrap());
        let settings = PostProcessingSettings {
            command: Some("/bin/true".to_string()),
            ..Default::default()
        };
        let (_, order_id) = seed(&store, settings);
        let processor = processor(Arc::clone(&store));

        let err = processor.make_job(order_id, false).unwrap_err();
        assert!(matches!(
            err,
            PostProcessError::OrderNotValid {
                status: OrderStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_make_job_requires_something_to_do() {
        let store = Arc::new(SqliteOrderStore::in_memory().unwrap());
        let (certificate_id, order_id) = seed(&store, PostProcessingSettings::default());
        let key_id = store.get_one_certificate(certificate_id).unwrap().key.id;
        make_valid(&store, order_id, key_id);
        let processor = processor(Arc::clone(&store));

        let err = processor.make_job(order_id, false).unwrap_err();
        assert!(matches!(err, PostProcessError::NothingToDo { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_runs_script_with_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let script = dir.path().join("hook.sh");
        std::fs::write(
            &script,
            format!("printf '%s|%s' \"$NAME\" \"$CN\" > {}\n", out.display()),
        )
        .unwrap();

        let store = Arc::new(SqliteOrderStore::in_memory().unwrap());
        let settings = PostProcessingSettings {
            command: Some(script.display().to_string()),
            environment: vec![
                "NAME={{CERTIFICATE_NAME}}".to_string(),
                "CN={{certificate_common_name}}".to_string(),
            ],
            ..Default::default()
        };
        let (certificate_id, order_id) = seed(&store, settings);
        let key_id = store.get_one_certificate(certificate_id).unwrap().key.id;
        make_valid(&store, order_id, key_id);

        let report = processor(Arc::clone(&store)).execute(order_id).await.unwrap();

        assert!(matches!(report.script, MechanismOutcome::Succeeded));
        assert!(matches!(report.client, MechanismOutcome::Skipped));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "web|example.com");
    }
}
