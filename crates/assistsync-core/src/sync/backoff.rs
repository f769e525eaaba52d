use std::time::Duration;

use rand::Rng;

use crate::config::SyncConfig;

/// Exponential backoff with jitter for failed pushes.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    jitter: f64,
}

impl Backoff {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            base: config.retry_base,
            cap: config.retry_cap,
            max_attempts: config.max_attempts,
            jitter: config.retry_jitter.clamp(0.0, 1.0),
        }
    }

    /// True once `failures` failed pushes used up the initial push and all
    /// `max_attempts` retries.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures > self.max_attempts
    }

    /// Nominal delay after the `failures`-th failed push: base, 2*base,
    /// 4*base, ... capped.
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Nominal delay shortened by a random fraction of up to `jitter`, so
    /// clients that failed together do not retry together.
    pub fn delay(&self, failures: u32) -> Duration {
        let nominal = self.nominal_delay(failures);
        if self.jitter == 0.0 {
            return nominal;
        }
        let cut = rand::thread_rng().gen_range(0.0..=self.jitter);
        nominal.mul_f64(1.0 - cut)
    }
}
