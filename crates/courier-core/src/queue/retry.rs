//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with optional proportional jitter.
///
/// delay = min(base_delay * multiplier^retry_count, max_delay), then
/// jittered by up to ±`jitter` of itself and capped again.
///
/// Example with base_delay=2s, multiplier=2.0, max_delay=1h, no jitter:
/// - retry_count 0 (first failure): 2s
/// - retry_count 1: 4s
/// - retry_count 2: 8s
/// - retry_count 11: 1h (capped)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction in `[0.0, 1.0]`; `0.0` disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60 * 60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn without_jitter(self) -> Self {
        self.with_jitter(0.0)
    }

    /// Deterministic part of the delay for a task that has failed
    /// `retry_count` times before this failure.
    pub fn base_backoff(&self, retry_count: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Full delay using the thread-local RNG for jitter.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.backoff_with(retry_count, &mut rand::thread_rng())
    }

    /// Full delay with a caller-supplied RNG (seed it for reproducible tests).
    pub fn backoff_with<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let base = self.base_backoff(retry_count);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        let secs = (base.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}
