//! Periodic renewal sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::info::RenewalInfo;
use crate::config::RenewalConfig;
use crate::fulfillment::{FulfillmentError, OrderService};
use crate::metrics;
use crate::order::Order;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalSweep {
    /// Incomplete orders queued again.
    pub resumed: usize,
    /// Valid orders whose renewal time was evaluated.
    pub evaluated: usize,
    /// New orders placed because a renewal window arrived.
    pub renewals_placed: usize,
}

/// Resumes incomplete orders and places renewal orders on a timer.
pub struct RenewalScheduler {
    config: RenewalConfig,
    service: Arc<OrderService>,
    shutdown: CancellationToken,

    // Runtime state
    running: Arc<AtomicBool>,
    stop_token: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RenewalScheduler {
    pub fn new(config: RenewalConfig, service: Arc<OrderService>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            service,
            shutdown,
            running: Arc::new(AtomicBool::new(false)),
            stop_token: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the background loop. The first sweep runs after the initial
    /// delay, later ones every interval plus random jitter.
    pub async fn start(&self) {
        if !self.config.enabled {
            info!("Renewal scheduler disabled");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Renewal scheduler already running");
            return;
        }

        let token = self.shutdown.child_token();
        *self.stop_token.lock().unwrap_or_else(|p| p.into_inner()) = Some(token.clone());

        let running = Arc::clone(&self.running);
        let service = Arc::clone(&self.service);
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            info!("Renewal loop started");
            let mut delay = Duration::from_secs(config.initial_delay_secs);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Renewal loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        let sweep = Self::sweep(&service, config.interval()).await;
                        debug!("Renewal sweep finished: {:?}", sweep);
                        delay = next_delay(&config);
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("Renewal loop stopped");
        });

        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Stop the loop and wait for an in-progress sweep to finish.
    pub async fn stop(&self) {
        let token = self
            .stop_token
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(token) = token else {
            warn!("Renewal scheduler not running");
            return;
        };

        info!("Stopping renewal scheduler");
        token.cancel();

        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Renewal loop ended abnormally: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run one sweep now.
    pub async fn run_once(&self) -> RenewalSweep {
        Self::sweep(&self.service, self.config.interval()).await
    }

    async fn sweep(service: &OrderService, interval: Duration) -> RenewalSweep {
        let resumed = match service.retry_incomplete_orders() {
            Ok(count) => count,
            Err(e) => {
                error!("Failed to resume incomplete orders: {}", e);
                0
            }
        };

        let now = Utc::now();
        let orders = match service.store().get_all_valid_current_orders(now) {
            Ok(orders) => orders,
            Err(e) => {
                error!("Failed to load valid orders for renewal: {}", e);
                return RenewalSweep {
                    resumed,
                    ..Default::default()
                };
            }
        };

        let horizon = now + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());
        let evaluated = orders.len();
        let results = join_all(
            orders
                .into_iter()
                .map(|order| evaluate_order(service, order, now, horizon)),
        )
        .await;

        let renewals_placed = results.into_iter().filter(|placed| *placed).count();
        if renewals_placed > 0 {
            info!("Placed {} renewal orders", renewals_placed);
        }

        RenewalSweep {
            resumed,
            evaluated,
            renewals_placed,
        }
    }
}

fn next_delay(config: &RenewalConfig) -> Duration {
    let jitter = if config.jitter_secs > 0 {
        rand::rng().random_range(0..config.jitter_secs)
    } else {
        0
    };
    config.interval() + Duration::from_secs(jitter)
}

/// Refresh one order's renewal info and place a new order when its renewal
/// time falls before `horizon`. Returns whether an order was placed.
async fn evaluate_order(
    service: &OrderService,
    order: Order,
    now: DateTime<Utc>,
    horizon: DateTime<Utc>,
) -> bool {
    match try_evaluate_order(service, &order, now, horizon).await {
        Ok(placed) => placed,
        Err(e) => {
            error!(
                "Renewal check failed for order {} (certificate {}): {}",
                order.id, order.certificate.name, e
            );
            false
        }
    }
}

async fn try_evaluate_order(
    service: &OrderService,
    order: &Order,
    now: DateTime<Utc>,
    horizon: DateTime<Utc>,
) -> Result<bool, FulfillmentError> {
    let acme = service
        .acme_provider()
        .acme_service(order.certificate.account.acme_server_id)?;

    let mut fresh: Option<RenewalInfo> = None;

    let wants_refresh = order
        .renewal_info
        .as_ref()
        .map_or(true, |info| info.needs_refresh(now));
    if acme.supports_ari() && wants_refresh {
        if let Some(pem) = order.pem.as_deref() {
            match acme.get_renewal_info(pem).await {
                Ok(info) => {
                    metrics::ARI_FETCHES.with_label_values(&["success"]).inc();
                    fresh = Some(RenewalInfo::from_acme(info, now));
                }
                Err(e) => {
                    metrics::ARI_FETCHES.with_label_values(&["failure"]).inc();
                    warn!(
                        "Failed to fetch renewal info for order {} (certificate {}): {}",
                        order.id, order.certificate.name, e
                    );
                }
            }
        }
    }

    if fresh.is_none() && order.renewal_info.is_none() {
        let (Some(valid_from), Some(valid_to)) = (order.valid_from, order.valid_to) else {
            debug!("Order {} has no validity window, skipping renewal check", order.id);
            return Ok(false);
        };
        fresh = Some(RenewalInfo::heuristic(valid_from, valid_to));
    }

    if let Some(info) = &fresh {
        if let Err(e) = service.store().put_renewal_info(order.id, info) {
            error!("Failed to save renewal info for order {}: {}", order.id, e);
        }
    }

    let Some(info) = fresh.as_ref().or(order.renewal_info.as_ref()) else {
        return Ok(false);
    };

    let renewal_time = info.select_renewal_time();
    if renewal_time >= horizon {
        debug!(
            "Certificate {} renews at {}",
            order.certificate.name, renewal_time
        );
        return Ok(false);
    }

    info!(
        "Certificate {} reached its renewal time ({}), placing a new order",
        order.certificate.name, renewal_time
    );
    service
        .place_new_order_and_fulfill(order.certificate.id, false)
        .await?;
    metrics::RENEWAL_ORDERS_PLACED.inc();
    Ok(true)
}
