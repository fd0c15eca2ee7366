//! Retry policies for failed jobs

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy deciding the delay before a retry attempt.
///
/// `attempt` is 1-indexed: the delay computed for attempt `n` is applied
/// after the `n`-th failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum BackoffStrategy {
    /// `base_delay × attempt`
    Linear,

    /// `base_delay × 2^(attempt - 1)`, capped
    Exponential {
        #[serde(default = "default_max_delay_secs")]
        max_delay_secs: u64,
    },

    /// `base_delay` regardless of attempt
    Fixed,

    /// Linear delay randomized by ± `jitter` fraction
    Jittered {
        #[serde(default = "default_jitter")]
        jitter: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Linear
    }
}

impl BackoffStrategy {
    /// Compute the delay before the next attempt.
    pub fn delay(&self, base_delay: Duration, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::Linear => base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential { max_delay_secs } => {
                let exponent = attempt.saturating_sub(1).min(32);
                let delay = base_delay.saturating_mul(1u32 << exponent.min(31));
                delay.min(Duration::from_secs(*max_delay_secs))
            }
            BackoffStrategy::Fixed => base_delay,
            BackoffStrategy::Jittered { jitter } => {
                let linear = base_delay.saturating_mul(attempt).as_secs_f64();
                let jitter = jitter.clamp(0.0, 1.0);
                let spread = linear * jitter;
                let offset = if spread > 0.0 {
                    use rand::Rng;
                    rand::thread_rng().gen_range(-spread..=spread)
                } else {
                    0.0
                };
                Duration::from_secs_f64((linear + offset).max(0.0))
            }
        }
    }
}

/// Retry policy: attempt budget plus backoff schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum execution attempts (≥ 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay fed into the backoff strategy
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Backoff schedule
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_secs: base_delay.as_secs(),
            backoff: BackoffStrategy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    /// Whether another attempt is allowed after `attempts` executions.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the attempt following `attempts` executions.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.backoff.delay(self.base_delay(), attempts)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    30
}

fn default_max_delay_secs() -> u64 {
    3600
}

fn default_jitter() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let base = Duration::from_secs(10);
        assert_eq!(
            BackoffStrategy::Linear.delay(base, 1),
            Duration::from_secs(10)
        );
        assert_eq!(
            BackoffStrategy::Linear.delay(base, 2),
            Duration::from_secs(20)
        );
        assert_eq!(
            BackoffStrategy::Linear.delay(base, 3),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let strategy = BackoffStrategy::Exponential {
            max_delay_secs: 40,
        };
        let base = Duration::from_secs(10);
        assert_eq!(strategy.delay(base, 1), Duration::from_secs(10));
        assert_eq!(strategy.delay(base, 2), Duration::from_secs(20));
        assert_eq!(strategy.delay(base, 3), Duration::from_secs(40));
        // Capped
        assert_eq!(strategy.delay(base, 4), Duration::from_secs(40));
    }

    #[test]
    fn test_fixed_backoff() {
        let base = Duration::from_secs(10);
        assert_eq!(BackoffStrategy::Fixed.delay(base, 5), base);
    }

    #[test]
    fn test_jittered_backoff_within_bounds() {
        let strategy = BackoffStrategy::Jittered { jitter: 0.5 };
        let base = Duration::from_secs(10);
        for _ in 0..20 {
            let delay = strategy.delay(base, 2).as_secs_f64();
            assert!((10.0..=30.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay(), Duration::from_secs(30));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_policy_delay_schedule() {
        let policy = RetryPolicy::new(3, Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
    }

    #[test]
    fn test_min_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
    }
}
