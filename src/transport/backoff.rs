// Reconnect delay policy: capped exponential growth plus additive jitter

use rand::Rng;
use std::time::Duration;

use crate::config::TransportConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub growth_factor: f64,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &TransportConfig) -> Self {
        BackoffPolicy {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            growth_factor: config.growth_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
            max_retries: config.max_retries,
        }
    }

    /// `min(initial * growth^retry, max)`, no jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.growth_factor.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        // powi overflows to infinity long before the cast could misbehave
        Duration::from_millis(millis.min(cap) as u64)
    }

    /// Base delay plus a random extra of up to `jitter_ratio` of it.
    /// Jitter is only ever added.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter_ratio <= 0.0 {
            return base;
        }
        let extra = base.as_millis() as f64 * rng.gen_range(0.0..self.jitter_ratio);
        base + Duration::from_millis(extra as u64)
    }

    /// Delay before attempt `retry`; the very first attempt goes out immediately
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        if retry == 0 {
            Duration::ZERO
        } else {
            self.jittered_delay(retry, rng)
        }
    }

    pub fn retries_exhausted(&self, retry: u32) -> bool {
        retry >= self.max_retries
    }
}
