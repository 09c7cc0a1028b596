//! Exponential backoff with full jitter for the retry engine.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `min(max, base × multiplier^attempt)`, with a jitter
/// term drawn uniformly from `[0, base)` added on top.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        Self { base, max, multiplier }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Raw delay for a 0-indexed attempt, before jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay with jitter applied, for production use.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.jittered_delay_with_rng(attempt, &mut rand::rng())
    }

    /// Delay with jitter drawn from the supplied RNG, for deterministic tests.
    pub fn jittered_delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_millis = self.base.as_millis() as u64;
        let jitter = if base_millis == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.random_range(0..base_millis))
        };
        self.delay(attempt) + jitter
    }
}
