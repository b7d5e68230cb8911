//! Exponential backoff with jitter.
//!
//! Contending processes are human-driven CLI invocations, so fairness is
//! best-effort: randomized delays keep them from retrying in lockstep, and
//! nobody queues.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff state for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay for `attempt` given a jitter sample in `[0, 1]`.
    ///
    /// The exponential step `base * 2^attempt` is capped at `max`; the delay
    /// is the upper half of that step scaled by `jitter`, so it never drops
    /// below half the step.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let step = self.base.saturating_mul(factor).min(self.max);
        let half = step / 2;
        half + half.mul_f64(jitter.clamp(0.0, 1.0))
    }

    /// Next randomized delay; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..=1.0);
        let delay = self.delay_for(self.attempt, jitter);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
