//! Configuration for the invocation engine
//!
//! Plain, immutable values with documented defaults. There is no ambient
//! global configuration: these are constructed once at the composition root
//! and handed to [`CallExecutorBuilder`](crate::executor::CallExecutorBuilder).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, counting the first one. `1` disables
    /// retrying entirely.
    pub max_attempts: usize,

    /// Delay before the first re-attempt
    pub initial_delay: Duration,

    /// Upper bound on any single backoff delay
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_factor: f64,

    /// Apply full jitter to each delay (see [`RetryConfig::delay_for_attempt`])
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before re-running attempt `attempt` (1-based, so the
    /// delay after the first failure is `delay_for_attempt(1)`).
    ///
    /// The schedule is capped full-jitter exponential backoff: the capped
    /// value is `min(max_delay, initial_delay * backoff_factor^(attempt-1))`,
    /// and with `jitter` enabled the actual delay is drawn uniformly from
    /// zero up to that value.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ceiling = self
            .initial_delay
            .mul_f64(self.backoff_factor.powi(exp))
            .min(self.max_delay);
        if self.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            ceiling.mul_f64(rng.gen_range(0.0..=1.0))
        } else {
            ceiling
        }
    }
}

/// Concurrency throttle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Maximum simultaneous in-flight attempts per throttle instance
    pub max_concurrent: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { max_concurrent: 5 }
    }
}
