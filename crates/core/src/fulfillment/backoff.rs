use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::config::BackoffConfig;

/// Wait between polls of an order the server is still processing.
///
/// Never gives up on its own; the fulfillment deadline bounds the total
/// time instead.
#[derive(Debug)]
pub struct AcmeBackoff {
    inner: ExponentialBackoff,
}

impl AcmeBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(config.initial_interval_ms))
            .with_multiplier(config.multiplier)
            .with_randomization_factor(config.randomization_factor)
            .with_max_interval(Duration::from_millis(config.max_interval_ms))
            .with_max_elapsed_time(None)
            .build();
        Self { inner }
    }

    /// Next randomized interval. Grows by the multiplier up to the cap.
    pub fn next_backoff(&mut self) -> Duration {
        self.inner
            .next_backoff()
            .unwrap_or(self.inner.max_interval)
    }

    /// Start over from the initial interval.
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within(d: Duration, center_ms: f64, factor: f64) -> bool {
        let ms = d.as_secs_f64() * 1000.0;
        ms >= center_ms * (1.0 - factor) - 1.0 && ms <= center_ms * (1.0 + factor) + 1.0
    }

    #[test]
    fn test_intervals_grow_with_jitter() {
        let mut backoff = AcmeBackoff::new(&BackoffConfig::default());

        let expected = [7000.0, 9800.0, 13720.0, 19208.0];
        for center in expected {
            let d = backoff.next_backoff();
            assert!(within(d, center, 0.4), "{:?} not around {}ms", d, center);
        }
    }

    #[test]
    fn test_interval_is_capped() {
        let mut backoff = AcmeBackoff::new(&BackoffConfig::default());
        for _ in 0..30 {
            backoff.next_backoff();
        }
        for _ in 0..10 {
            let d = backoff.next_backoff();
            assert!(within(d, 60_000.0, 0.4), "{:?} exceeds the cap", d);
        }
    }

    #[test]
    fn test_reset() {
        let config = BackoffConfig {
            randomization_factor: 0.0,
            ..Default::default()
        };
        let mut backoff = AcmeBackoff::new(&config);

        assert!(within(backoff.next_backoff(), 7000.0, 0.0));
        assert!(within(backoff.next_backoff(), 9800.0, 0.0));
        backoff.reset();
        assert!(within(backoff.next_backoff(), 7000.0, 0.0));
    }
}
