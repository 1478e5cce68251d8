//! Exponential backoff with jitter.

use std::env;
use std::time::Duration;

use rand::Rng;

/// Retry schedule shared by watchers, RPC clients and the dispatcher.
///
/// Attempt `n` (1-based) waits `base_delay * 2^(n-1)`, capped at `max_delay`,
/// then reduced by up to `jitter` of itself. With `jitter < 0.5` consecutive
/// delays strictly increase until the cap.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fraction in `[0, 1)`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// Read `{PREFIX}_BACKOFF_BASE_MS`, `{PREFIX}_BACKOFF_MAX_MS`,
    /// `{PREFIX}_MAX_ATTEMPTS` and `{PREFIX}_BACKOFF_JITTER`, falling back to
    /// `defaults` for anything unset or unparsable.
    #[must_use]
    pub fn from_env(prefix: &str, defaults: BackoffPolicy) -> Self {
        let read = |suffix: &str| env::var(format!("{}_{}", prefix, suffix)).ok();

        let base_delay = read("BACKOFF_BASE_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay);
        let max_delay = read("BACKOFF_MAX_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay);
        let max_attempts = read("MAX_ATTEMPTS")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.max_attempts);
        let jitter = read("BACKOFF_JITTER")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(defaults.jitter);

        Self {
            base_delay,
            max_delay,
            max_attempts,
            jitter: 0.0,
        }
        .with_jitter(jitter)
    }

    /// Delay before retry `attempt` without jitter
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before retry `attempt` with jitter applied
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let reduction: f64 = rand::thread_rng().gen_range(0.0..self.jitter);
        base.mul_f64(1.0 - reduction)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts
    #[must_use]
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
