//! Entry points for queueing and placing orders.

use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::FulfillmentError;
use super::job::{FulfillContext, OrderFulfillJob, ReloadCallback, FULFILLMENT_LABEL};
use super::status::{work_status, WorkStatus};
use crate::acme::{
    renewal_identifier, AcmeIdentifier, AcmeServiceProvider, AuthorizationFulfiller, CsrBuilder,
    NewOrderRequest,
};
use crate::config::Config;
use crate::job_manager::{JobManager, JobManagerError};
use crate::order::{OrderStore, StoreError};
use crate::post_process::{PostProcessError, PostProcessor};

/// Owns the fulfillment and post-processing job managers.
pub struct OrderService {
    ctx: Arc<FulfillContext>,
    manager: JobManager<OrderFulfillJob>,
}

impl OrderService {
    /// Create the service and start both worker pools.
    pub fn new(
        config: &Config,
        store: Arc<dyn OrderStore>,
        acme: Arc<dyn AcmeServiceProvider>,
        authorizations: Arc<dyn AuthorizationFulfiller>,
        csr: Arc<dyn CsrBuilder>,
        shutdown: CancellationToken,
    ) -> Result<Self, FulfillmentError> {
        let post_processor = PostProcessor::new(
            &config.post_processing,
            Arc::clone(&store),
            shutdown.clone(),
        )?;

        Self::with_post_processor(
            config,
            store,
            acme,
            authorizations,
            csr,
            Arc::new(post_processor),
            shutdown,
        )
    }

    /// Create the service around an existing post-processor.
    pub fn with_post_processor(
        config: &Config,
        store: Arc<dyn OrderStore>,
        acme: Arc<dyn AcmeServiceProvider>,
        authorizations: Arc<dyn AuthorizationFulfiller>,
        csr: Arc<dyn CsrBuilder>,
        post_processor: Arc<PostProcessor>,
        shutdown: CancellationToken,
    ) -> Result<Self, FulfillmentError> {
        let manager = JobManager::new(
            FULFILLMENT_LABEL,
            config.fulfillment.workers,
            shutdown.clone(),
        )?;

        let ctx = Arc::new(FulfillContext {
            store,
            acme,
            authorizations,
            csr,
            config: config.fulfillment.clone(),
            server_certificate_name: config.server_certificate_name.clone(),
            post_processor,
            reload: RwLock::new(None),
            shutdown,
        });

        Ok(Self { ctx, manager })
    }

    /// Install the hook run when the application's own certificate renews.
    pub fn set_reload_callback(&self, callback: ReloadCallback) {
        *self.ctx.reload.write().unwrap_or_else(|p| p.into_inner()) = Some(callback);
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.ctx.store
    }

    pub fn acme_provider(&self) -> &Arc<dyn AcmeServiceProvider> {
        &self.ctx.acme
    }

    pub fn manager(&self) -> &JobManager<OrderFulfillJob> {
        &self.manager
    }

    pub fn post_processor(&self) -> &Arc<PostProcessor> {
        &self.ctx.post_processor
    }

    /// Queue fulfillment of a stored order.
    pub fn fulfill_order(&self, order_id: i64, high_priority: bool) -> Result<(), FulfillmentError> {
        let job = OrderFulfillJob::new(Arc::clone(&self.ctx), order_id, high_priority)?;
        self.manager.add_job(job)?;
        Ok(())
    }

    /// Queue post-processing of a valid order.
    pub fn post_process(&self, order_id: i64, high_priority: bool) -> Result<(), PostProcessError> {
        self.ctx.post_processor.post_process(order_id, high_priority)
    }

    /// Place a fresh ACME order for a certificate and queue its fulfillment.
    ///
    /// Returns the stored order id. Failing to queue the new order is
    /// logged, not returned: the order exists and the next resume sweep
    /// picks it up.
    pub async fn place_new_order_and_fulfill(
        &self,
        certificate_id: i64,
        high_priority: bool,
    ) -> Result<i64, FulfillmentError> {
        let store = &self.ctx.store;
        let certificate = store.get_one_certificate(certificate_id)?;
        let account = certificate.account.account_key();
        let service = self.ctx.acme.acme_service(certificate.account.acme_server_id)?;

        let replaces = if service.supports_ari() {
            self.replaced_certificate_id(certificate_id)?
        } else {
            None
        };

        let request = NewOrderRequest {
            identifiers: certificate
                .dns_names()
                .into_iter()
                .map(AcmeIdentifier::dns)
                .collect(),
            replaces,
        };

        let acme_order = service.new_order(&request, &account).await?;
        debug!("New order location: {}", acme_order.location);

        let order_id = store.post_new_order(certificate_id, &acme_order)?;

        if let Err(e) = store.update_cert_updated_time(certificate_id) {
            error!(
                "Failed to update certificate {} timestamp: {}",
                certificate_id, e
            );
        }

        match self.fulfill_order(order_id, high_priority) {
            Ok(()) => info!(
                "Placed order {} for certificate {}",
                order_id, certificate.name
            ),
            Err(e) => error!(
                "Placed order {} for certificate {} but could not queue it: {}",
                order_id, certificate.name, e
            ),
        }

        Ok(order_id)
    }

    /// ARI identifier of the newest issued certificate, if any.
    fn replaced_certificate_id(&self, certificate_id: i64) -> Result<Option<String>, StoreError> {
        let orders = self.ctx.store.get_orders_by_cert(certificate_id)?;
        let Some(pem) = orders.iter().find_map(|order| order.pem.as_deref()) else {
            return Ok(None);
        };

        match renewal_identifier(pem) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                debug!(
                    "No ARI identifier for the certificate replaced by {}: {}",
                    certificate_id, e
                );
                Ok(None)
            }
        }
    }

    /// Queue every order still `pending`, `ready` or `processing` at low
    /// priority. Returns how many were queued.
    pub fn retry_incomplete_orders(&self) -> Result<usize, FulfillmentError> {
        let order_ids = self.ctx.store.get_all_incomplete_order_ids()?;

        let mut added = 0;
        for order_id in order_ids {
            match self.fulfill_order(order_id, false) {
                Ok(()) => added += 1,
                Err(FulfillmentError::JobManager(JobManagerError::DuplicateJob(_))) => {
                    debug!("Order {} already queued", order_id);
                }
                Err(e) => error!("Failed to queue incomplete order {}: {}", order_id, e),
            }
        }

        info!("Added {} incomplete orders to the fulfillment queue", added);
        Ok(added)
    }

    pub fn fulfilling_status(&self) -> Result<WorkStatus, StoreError> {
        work_status(self.ctx.store.as_ref(), &self.manager.all_current_jobs())
    }

    pub fn post_processing_status(&self) -> Result<WorkStatus, StoreError> {
        work_status(
            self.ctx.store.as_ref(),
            &self.ctx.post_processor.all_current_jobs(),
        )
    }

    /// Wait for both worker pools to exit after shutdown.
    pub async fn wait_for_workers(&self) {
        self.manager.wait_for_workers().await;
        self.ctx.post_processor.manager().wait_for_workers().await;
    }
}
