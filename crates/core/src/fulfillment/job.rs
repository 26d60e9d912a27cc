//! The order fulfillment state machine.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::AcmeBackoff;
use super::error::FulfillmentError;
use super::status::QueuedOrderJob;
use crate::acme::{
    leaf_validity, AccountKey, AcmeOrder, AcmeService, AcmeServiceProvider, AuthorizationFulfiller,
    AuthorizationStatus, CsrBuilder, OrderStatus,
};
use crate::config::FulfillmentConfig;
use crate::job_manager::Job;
use crate::metrics;
use crate::order::{Order, OrderStore};
use crate::post_process::PostProcessor;

/// Manager label used in logs and metrics.
pub const FULFILLMENT_LABEL: &str = "fulfillment";

/// Hook that swaps in the application's own certificate after renewal.
pub type ReloadCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Dependencies shared by every fulfillment job.
pub(crate) struct FulfillContext {
    pub(crate) store: Arc<dyn OrderStore>,
    pub(crate) acme: Arc<dyn AcmeServiceProvider>,
    pub(crate) authorizations: Arc<dyn AuthorizationFulfiller>,
    pub(crate) csr: Arc<dyn CsrBuilder>,
    pub(crate) config: FulfillmentConfig,
    pub(crate) server_certificate_name: Option<String>,
    pub(crate) post_processor: Arc<PostProcessor>,
    pub(crate) reload: RwLock<Option<ReloadCallback>>,
    pub(crate) shutdown: CancellationToken,
}

/// How a fulfillment run ended once the final snapshot was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FulfillOutcome {
    pub status: OrderStatus,
    /// The run hit its deadline before reaching a final status.
    pub timed_out: bool,
}

/// What to do after handling one fetched order.
enum Step {
    Refetch,
    Wait(Duration),
    Done,
}

/// Drives one stored order to `valid` or `invalid`.
#[derive(Clone)]
pub struct OrderFulfillJob {
    ctx: Arc<FulfillContext>,
    order_id: i64,
    high_priority: bool,
    added_to_queue: DateTime<Utc>,
}

impl std::fmt::Debug for OrderFulfillJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderFulfillJob")
            .field("order_id", &self.order_id)
            .field("high_priority", &self.high_priority)
            .field("added_to_queue", &self.added_to_queue)
            .finish()
    }
}

impl OrderFulfillJob {
    /// Build a job for a stored order. Orders that are already final are
    /// refused.
    pub(crate) fn new(
        ctx: Arc<FulfillContext>,
        order_id: i64,
        high_priority: bool,
    ) -> Result<Self, FulfillmentError> {
        let order = ctx.store.get_one_order(order_id)?;
        if order.status.is_terminal() {
            return Err(FulfillmentError::AlreadyFinal {
                order_id,
                status: order.status,
            });
        }

        Ok(Self {
            ctx,
            order_id,
            high_priority,
            added_to_queue: Utc::now(),
        })
    }

    pub fn order_id(&self) -> i64 {
        self.order_id
    }

    pub fn added_to_queue(&self) -> DateTime<Utc> {
        self.added_to_queue
    }

    /// Run the state machine.
    ///
    /// `Ok` means the latest ACME snapshot was written back. Errors leave
    /// storage as it was at the failure point, except for a discarded order
    /// which is marked invalid.
    pub async fn execute(&self, worker_id: usize) -> Result<FulfillOutcome, FulfillmentError> {
        let ctx = &self.ctx;
        let order = ctx.store.get_one_order(self.order_id)?;

        let result = self.drive(&order, worker_id).await;

        if let Err(e) = ctx.store.update_cert_updated_time(order.certificate.id) {
            error!(
                "Fulfillment worker {} failed to update certificate timestamp for order {}: {}",
                worker_id, order.id, e
            );
        }

        result
    }

    async fn drive(&self, order: &Order, worker_id: usize) -> Result<FulfillOutcome, FulfillmentError> {
        let ctx = &self.ctx;
        let account = order.certificate.account.account_key();
        let service = ctx.acme.acme_service(order.certificate.account.acme_server_id)?;

        let deadline = Instant::now() + ctx.config.timeout();
        let mut backoff = AcmeBackoff::new(&ctx.config.backoff);

        let mut acme_order = self.fetch(order, service.as_ref(), &account).await?;
        let timed_out = loop {
            if acme_order.status != OrderStatus::Processing {
                backoff.reset();
            }

            let step = self
                .advance(order, &acme_order, service.as_ref(), &account, &mut backoff, worker_id)
                .await?;

            match step {
                Step::Done => break false,
                Step::Refetch => {}
                Step::Wait(delay) => self.wait(delay).await?,
            }

            if Instant::now() >= deadline {
                break true;
            }
            acme_order = self.fetch(order, service.as_ref(), &account).await?;
        };

        ctx.store.put_order_acme(order.id, &acme_order)?;

        if acme_order.status == OrderStatus::Valid {
            self.after_valid(order, worker_id);
        }

        Ok(FulfillOutcome {
            status: acme_order.status,
            timed_out,
        })
    }

    /// Fetch the order from the server. A 404 means the CA discarded it.
    async fn fetch(
        &self,
        order: &Order,
        service: &dyn AcmeService,
        account: &AccountKey,
    ) -> Result<AcmeOrder, FulfillmentError> {
        match service.get_order(&order.location, account).await {
            Ok(acme_order) => Ok(acme_order),
            Err(e) if e.is_not_found() => {
                self.ctx.store.put_order_invalid(order.id)?;
                Err(FulfillmentError::OrderDiscarded(order.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn advance(
        &self,
        order: &Order,
        acme_order: &AcmeOrder,
        service: &dyn AcmeService,
        account: &AccountKey,
        backoff: &mut AcmeBackoff,
        worker_id: usize,
    ) -> Result<Step, FulfillmentError> {
        let ctx = &self.ctx;

        match acme_order.status {
            OrderStatus::Pending => {
                let auth_status = ctx
                    .authorizations
                    .fulfill_auths(&acme_order.authorizations, account, service)
                    .await?;
                if auth_status != AuthorizationStatus::Valid {
                    debug!(
                        "Fulfillment worker {} saw order {} authorizations {:?}, fetching order again",
                        worker_id, order.id, auth_status
                    );
                    return Ok(Step::Refetch);
                }
                // Authorized: the order is ready to finalize.
                self.finalize(order, acme_order, service, account, worker_id)
                    .await
            }

            OrderStatus::Ready => {
                self.finalize(order, acme_order, service, account, worker_id)
                    .await
            }

            OrderStatus::Processing => {
                let delay = backoff.next_backoff();
                debug!(
                    "Fulfillment worker {} found order {} processing, checking again in {:?}",
                    worker_id, order.id, delay
                );
                Ok(Step::Wait(delay))
            }

            OrderStatus::Valid => {
                let Some(certificate_url) = acme_order.certificate.as_deref() else {
                    let delay = backoff.next_backoff();
                    warn!(
                        "Fulfillment worker {} found order {} valid without a certificate url, checking again in {:?}",
                        worker_id, order.id, delay
                    );
                    return Ok(Step::Wait(delay));
                };

                let pem = service
                    .download_certificate(
                        certificate_url,
                        account,
                        order.certificate.preferred_root_cn.as_deref(),
                    )
                    .await?;
                let validity = leaf_validity(&pem)?;
                ctx.store.update_order_cert(order.id, &pem, &validity)?;

                info!(
                    "Fulfillment worker {} downloaded certificate for order {} (valid until {})",
                    worker_id, order.id, validity.not_after
                );
                Ok(Step::Done)
            }

            OrderStatus::Invalid => {
                match &acme_order.error {
                    Some(problem) => error!(
                        "Fulfillment worker {} found order {} invalid: {}",
                        worker_id, order.id, problem
                    ),
                    None => error!(
                        "Fulfillment worker {} found order {} invalid",
                        worker_id, order.id
                    ),
                }
                Ok(Step::Done)
            }

            OrderStatus::Unknown => Err(FulfillmentError::UnexpectedStatus {
                order_id: order.id,
                status: acme_order.status,
            }),
        }
    }

    /// Record the key, submit the CSR, then give the server a moment.
    async fn finalize(
        &self,
        order: &Order,
        acme_order: &AcmeOrder,
        service: &dyn AcmeService,
        account: &AccountKey,
        worker_id: usize,
    ) -> Result<Step, FulfillmentError> {
        let ctx = &self.ctx;

        // Must be stored before finalizing so a resumed run knows which key
        // the issued certificate belongs to.
        ctx.store
            .update_finalized_key(order.id, order.certificate.key.id)?;

        let csr = ctx.csr.make_csr_der(&order.certificate)?;
        let finalized = service
            .finalize_order(&acme_order.finalize, &csr, account)
            .await?;

        debug!(
            "Fulfillment worker {} finalized order {}, server reports {}",
            worker_id, order.id, finalized.status
        );
        Ok(Step::Wait(ctx.config.finalize_settle()))
    }

    /// Sleep unless shutdown is requested first.
    async fn wait(&self, delay: Duration) -> Result<(), FulfillmentError> {
        tokio::select! {
            _ = self.ctx.shutdown.cancelled() => Err(FulfillmentError::Shutdown),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn after_valid(&self, order: &Order, worker_id: usize) {
        let ctx = &self.ctx;
        let certificate = &order.certificate;

        if certificate.has_post_processing_to_do() {
            match ctx.post_processor.post_process(order.id, self.high_priority) {
                Ok(()) => debug!(
                    "Fulfillment worker {} queued post processing for order {}",
                    worker_id, order.id
                ),
                Err(e) => error!(
                    "Fulfillment worker {} failed to queue post processing for order {}: {}",
                    worker_id, order.id, e
                ),
            }
        }

        if ctx.server_certificate_name.as_deref() == Some(certificate.name.as_str()) {
            let callback = ctx
                .reload
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            match callback {
                Some(reload) => match reload() {
                    Ok(()) => info!(
                        "Fulfillment worker {} reloaded application certificate for order {}: {}",
                        worker_id, order.id, certificate.name
                    ),
                    Err(e) => error!(
                        "Fulfillment worker {} failed to reload application certificate for order {}: {}",
                        worker_id, order.id, e
                    ),
                },
                None => debug!(
                    "Fulfillment worker {} has no reload hook for application certificate of order {}",
                    worker_id, order.id
                ),
            }
        }
    }
}

#[async_trait]
impl Job for OrderFulfillJob {
    fn description(&self) -> String {
        format!("order id: {}", self.order_id)
    }

    fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    fn same_as(&self, other: &Self) -> bool {
        self.order_id == other.order_id
    }

    fn is_empty(&self) -> bool {
        self.order_id <= 0
    }

    async fn run(&self, worker_id: usize) {
        info!(
            "Fulfillment worker {} starting job ({})",
            worker_id,
            self.description()
        );

        let outcome = match self.execute(worker_id).await {
            Ok(FulfillOutcome {
                status,
                timed_out: true,
            }) => {
                warn!(
                    "Fulfillment worker {} exhausted retry loop for order {}, status left at {}",
                    worker_id, self.order_id, status
                );
                "timed_out"
            }
            Ok(FulfillOutcome { status, .. }) => {
                info!(
                    "Fulfillment worker {} completed order {} with status {}",
                    worker_id, self.order_id, status
                );
                status.as_str()
            }
            Err(FulfillmentError::OrderDiscarded(_)) => {
                error!(
                    "Fulfillment worker {} marked order {} invalid, not found on the ACME server",
                    worker_id, self.order_id
                );
                "not_found"
            }
            Err(FulfillmentError::Shutdown) => {
                info!(
                    "Fulfillment worker {} stopped order {} for shutdown",
                    worker_id, self.order_id
                );
                "aborted"
            }
            Err(e) => {
                error!(
                    "Fulfillment worker {} failed order {}: {}",
                    worker_id, self.order_id, e
                );
                "aborted"
            }
        };

        metrics::ORDERS_FINISHED
            .with_label_values(&[outcome])
            .inc();
    }
}

impl QueuedOrderJob for OrderFulfillJob {
    fn order_id(&self) -> i64 {
        self.order_id
    }

    fn added_to_queue(&self) -> DateTime<Utc> {
        self.added_to_queue
    }
}
