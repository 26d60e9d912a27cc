pub mod acme;
pub mod config;
pub mod fulfillment;
pub mod job_manager;
pub mod metrics;
pub mod order;
pub mod post_process;
pub mod renewal;
pub mod testing;

pub use config::{load_config, load_config_from_str, validate_config, Config, ConfigError};
pub use fulfillment::{FulfillmentError, OrderService, ReloadCallback, WorkStatus};
pub use job_manager::{Job, JobManager, JobManagerError};
pub use order::{OrderStore, SqliteOrderStore, StoreError};
pub use renewal::{RenewalInfo, RenewalScheduler};
