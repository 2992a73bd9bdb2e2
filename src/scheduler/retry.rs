//! Retry budget and backoff delays.

use std::time::Duration;

use rand::Rng;

use crate::config::SchedulerConfig;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`, with
/// optional proportional jitter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self { base, max, jitter }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_max, config.backoff_jitter)
    }

    /// Delay before the attempt that follows failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.max.as_millis().max(base_ms);
        let shift = attempt.saturating_sub(1).min(20);
        let backoff_ms = base_ms.saturating_mul(1u128 << shift).min(max_ms);
        let delay = Duration::from_millis(u64::try_from(backoff_ms).unwrap_or(u64::MAX));

        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0)).min(self.max)
    }
}

/// Attempts an action may make: `max_retries + 1` per budget, with one
/// extra budget for every task-level re-arm.
pub(crate) fn allowed_attempts(max_retries: u32, rearm_count: u32) -> u32 {
    max_retries
        .saturating_add(1)
        .saturating_mul(rearm_count.saturating_add(1))
}
