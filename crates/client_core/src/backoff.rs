//! Capped exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay, jitter included.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that may be shaved off at random, in `0.0..=1.0`.
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_ratio: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let ratio = self.policy.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return base;
        }
        let shave = base.as_secs_f64() * ratio * rng.gen_range(0.0..1.0);
        Duration::from_secs_f64((base.as_secs_f64() - shave).max(0.0))
    }

    fn base_delay(&self) -> Duration {
        let initial = self.policy.initial_delay.as_secs_f64();
        let max = self.policy.max_delay.as_secs_f64();
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let scaled = initial * self.policy.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= max {
            return self.policy.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}
