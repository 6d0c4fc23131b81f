//! Delays between reconnection attempts.
//!
//! The registry asks a [`RetryPolicy`] how long to wait before attempt `n`
//! (1-based). The attempt bound itself belongs to each world's settings, not
//! to the policy.

use std::time::Duration;

use nebula_config::{ConnectionsConfig, ReconnectStrategy};
use rand::Rng;

/// Default flat delay before each reconnection attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Computes the wait before a reconnection attempt.
pub trait RetryPolicy: Send + Sync + 'static {
    /// Delay before attempt `attempt` (1-based).
    fn delay(&self, attempt: u32) -> Duration;
}

/// The same delay before every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl Default for FixedDelay {
    fn default() -> Self {
        Self(DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Exponentially growing delay with multiplicative jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first attempt. Default: 1 s.
    pub initial_delay: Duration,
    /// Growth factor per attempt. Default: 2.0.
    pub multiplier: f64,
    /// Ceiling on any delay. Default: 30 s.
    pub max_delay: Duration,
    /// Jitter factor (0.0–1.0), applied as ±jitter. Default: 0.25.
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let base = Duration::from_secs_f64(base_secs.min(self.max_delay.as_secs_f64()));

        // Uniform in [base * (1 - jitter), base * (1 + jitter)]
        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        jittered.min(self.max_delay)
    }
}

/// Build the policy a config section asks for.
pub fn policy_from_config(config: &ConnectionsConfig) -> Box<dyn RetryPolicy> {
    let delay = Duration::from_millis(config.reconnect_delay_ms);
    match config.reconnect_strategy {
        ReconnectStrategy::Flat => Box::new(FixedDelay(delay)),
        ReconnectStrategy::Exponential => Box::new(ExponentialBackoff {
            initial_delay: delay,
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms).max(delay),
            ..ExponentialBackoff::default()
        }),
    }
}
