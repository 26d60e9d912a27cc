use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub fulfillment: FulfillmentConfig,
    #[serde(default)]
    pub post_processing: PostProcessingConfig,
    #[serde(default)]
    pub renewal: RenewalConfig,
    /// Name of the certificate this application serves itself. A freshly
    /// fulfilled order for it triggers the reload callback.
    #[serde(default)]
    pub server_certificate_name: Option<String>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("certhaven.db")
}

/// Order fulfillment configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FulfillmentConfig {
    /// Number of fulfillment workers (concurrent ACME orders).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Wall-clock ceiling for a single fulfillment run, in seconds.
    #[serde(default = "default_fulfillment_timeout")]
    pub timeout_secs: u64,

    /// Pause after a successful finalize before the order is fetched again,
    /// in milliseconds. Gives the CA a chance to skip `processing`.
    #[serde(default = "default_finalize_settle")]
    pub finalize_settle_ms: u64,

    /// Backoff used while the order is `processing`.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl FulfillmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn finalize_settle(&self) -> Duration {
        Duration::from_millis(self.finalize_settle_ms)
    }
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_secs: default_fulfillment_timeout(),
            finalize_settle_ms: default_finalize_settle(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    3
}

fn default_fulfillment_timeout() -> u64 {
    2 * 60 * 60 // 2 hours
}

fn default_finalize_settle() -> u64 {
    7000
}

/// Exponential backoff parameters for polling a `processing` order.
///
/// RFC 8555 suggests waiting 5-10 seconds between polls, so the first
/// interval sits in the middle of that range.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter applied to each interval, as a fraction (0.4 = +/-40%).
    #[serde(default = "default_randomization")]
    pub randomization_factor: f64,

    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            multiplier: default_multiplier(),
            randomization_factor: default_randomization(),
            max_interval_ms: default_max_interval(),
        }
    }
}

fn default_initial_interval() -> u64 {
    7000
}

fn default_multiplier() -> f64 {
    1.4
}

fn default_randomization() -> f64 {
    0.4
}

fn default_max_interval() -> u64 {
    60_000
}

/// Post-processing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostProcessingConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Port the remote install agent listens on.
    #[serde(default = "default_client_port")]
    pub client_port: u16,

    /// Request timeout for the remote install agent, in seconds.
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            client_port: default_client_port(),
            client_timeout_secs: default_client_timeout(),
        }
    }
}

fn default_client_port() -> u16 {
    5055
}

fn default_client_timeout() -> u64 {
    30
}

/// Renewal scheduler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenewalConfig {
    #[serde(default = "default_renewal_enabled")]
    pub enabled: bool,

    /// Time between scheduler runs, in seconds.
    #[serde(default = "default_renewal_interval")]
    pub interval_secs: u64,

    /// Delay before the first run after startup, in seconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Upper bound of the random delay added to every interval, in seconds.
    #[serde(default = "default_jitter")]
    pub jitter_secs: u64,
}

impl RenewalConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            enabled: default_renewal_enabled(),
            interval_secs: default_renewal_interval(),
            initial_delay_secs: default_initial_delay(),
            jitter_secs: default_jitter(),
        }
    }
}

fn default_renewal_enabled() -> bool {
    true
}

fn default_renewal_interval() -> u64 {
    2 * 60 * 60 // 2 hours
}

fn default_initial_delay() -> u64 {
    60
}

fn default_jitter() -> u64 {
    60
}
