//! Reconnect backoff policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction of each delay that may be added at random, 0.0..=1.0
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            max_ms: 8000,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// Per-worker backoff state. Delays grow geometrically from `initial_ms`
/// up to `max_ms` and reset after a successful read.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.config.initial_ms as f64
            * self.config.multiplier.max(1.0).powi(self.attempt.min(32) as i32);
        let capped = base.min(self.config.max_ms.max(self.config.initial_ms) as f64);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let extra = if jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=capped * jitter)
        } else {
            0.0
        };

        Duration::from_millis((capped + extra) as u64)
    }
}
