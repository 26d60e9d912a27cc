use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Worker counts are not 0
/// - Timeouts and intervals are not 0
/// - Backoff parameters are sane
/// - Remote agent port and timeout are not 0
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.fulfillment.workers == 0 {
        return Err(invalid("fulfillment.workers cannot be 0"));
    }
    if config.fulfillment.timeout_secs == 0 {
        return Err(invalid("fulfillment.timeout_secs cannot be 0"));
    }

    let backoff = &config.fulfillment.backoff;
    if backoff.initial_interval_ms == 0 {
        return Err(invalid("fulfillment.backoff.initial_interval_ms cannot be 0"));
    }
    if backoff.multiplier < 1.0 {
        return Err(invalid("fulfillment.backoff.multiplier must be at least 1.0"));
    }
    if !(0.0..=1.0).contains(&backoff.randomization_factor) {
        return Err(invalid(
            "fulfillment.backoff.randomization_factor must be between 0.0 and 1.0",
        ));
    }
    if backoff.max_interval_ms < backoff.initial_interval_ms {
        return Err(invalid(
            "fulfillment.backoff.max_interval_ms cannot be less than initial_interval_ms",
        ));
    }

    if config.post_processing.workers == 0 {
        return Err(invalid("post_processing.workers cannot be 0"));
    }
    if config.post_processing.client_port == 0 {
        return Err(invalid("post_processing.client_port cannot be 0"));
    }
    if config.post_processing.client_timeout_secs == 0 {
        return Err(invalid("post_processing.client_timeout_secs cannot be 0"));
    }

    if config.renewal.interval_secs == 0 {
        return Err(invalid("renewal.interval_secs cannot be 0"));
    }

    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_workers_fails() {
        let mut config = Config::default();
        config.fulfillment.workers = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let mut config = Config::default();
        config.post_processing.workers = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_backoff_bounds() {
        let mut config = Config::default();
        config.fulfillment.backoff.multiplier = 0.5;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.fulfillment.backoff.randomization_factor = 1.5;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.fulfillment.backoff.max_interval_ms = 1000;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_client_timeout_fails() {
        let mut config = Config::default();
        config.post_processing.client_timeout_secs = 0;
        let err = validate_config(&config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration validation failed: post_processing.client_timeout_secs cannot be 0"
        );
    }

    #[test]
    fn test_validate_zero_renewal_interval_fails() {
        let mut config = Config::default();
        config.renewal.interval_secs = 0;
        let err = validate_config(&config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration validation failed: renewal.interval_secs cannot be 0"
        );
    }
}
