//! Capped exponential backoff with jitter
//!
//! Shared by delivery retries and source reconnects. Attempt `n` waits
//! `base * 2^(n-1)`, capped, then scaled by a random factor in
//! `[1 - jitter, 1 + jitter]`. The jittered delay is clamped to the cap
//! again so the configured maximum is never exceeded.

use crate::config::DeliveryConfig;
use rand::Rng;
use std::time::Duration;

/// Retry delay policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any delay
    pub cap: Duration,
    /// Relative jitter (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Policy described by the delivery configuration
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
            config.jitter,
        )
    }

    /// Un-jittered delay after `attempt` failures (1-based)
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use streamhook::delivery::BackoffPolicy;
    ///
    /// let policy = BackoffPolicy::default();
    /// assert_eq!(policy.base_delay(1), Duration::from_secs(1));
    /// assert_eq!(policy.base_delay(3), Duration::from_secs(4));
    /// assert_eq!(policy.base_delay(20), Duration::from_secs(60));
    /// ```
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .saturating_mul(1u32 << exponent)
            .min(self.cap)
    }

    /// Jittered delay after `attempt` failures, never above the cap
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(delay.as_secs_f64() * factor).min(self.cap)
    }
}
