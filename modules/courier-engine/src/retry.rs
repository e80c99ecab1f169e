//! Backoff for the immediate publish that follows a commit.

use std::time::Duration;

use courier_common::OutboxConfig;

/// Bounded exponential backoff: `base_delay * multiplier^(attempt - 1)`,
/// capped at `max_delay`, for at most `max_attempts` attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Upper bound on a single publish attempt.
    pub attempt_timeout: Duration,
}

impl PublishRetryPolicy {
    pub fn from_config(config: &OutboxConfig) -> Self {
        Self {
            max_attempts: config.publish_attempts.max(1),
            base_delay: config.publish_backoff_base,
            multiplier: config.publish_backoff_multiplier,
            max_delay: config.publish_backoff_max,
            attempt_timeout: config.publish_timeout,
        }
    }

    /// Delay before the attempt after `attempt` failed (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for PublishRetryPolicy {
    fn default() -> Self {
        Self::from_config(&OutboxConfig::default())
    }
}
