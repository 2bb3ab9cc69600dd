//! Retry policies and failure classification.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * multiplier^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); the delay varies by up to this fraction either way.
    pub jitter: f64,
    /// Upper bound on a single attempt; an attempt that runs longer is a transient failure.
    #[serde(default)]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed),
    /// without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = self.multiplier.max(1.0).powi((attempt - 1) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * (attempt as f64),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Delay before the next retry with random jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        Duration::from_millis((delay.as_millis() as f64 * factor).max(0.0) as u64)
    }

    /// Check whether another attempt may follow `attempt` completed attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Worst-case wall time of one wrapped call, if attempts are bounded.
    pub fn max_total_latency(&self) -> Option<Duration> {
        let timeout = self.attempt_timeout?;
        let attempts = self.max_attempts.max(1);
        let slack = 1.0 + self.jitter.clamp(0.0, 1.0);
        let delays: Duration = (1..attempts)
            .map(|a| self.delay_for_attempt(a).mul_f64(slack))
            .sum();
        Some(delays + timeout * attempts)
    }
}

/// How a failure should be treated by the retry runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt (network blips, throttling, 5xx).
    Transient,
    /// Retrying cannot help (bad address, rejected payload).
    Terminal,
}

/// Default classification for an error type.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn multiplier_and_cap_apply() {
        let policy = RetryPolicy::exponential(6, Duration::from_millis(100), Duration::from_millis(1_000))
            .with_multiplier(3.0)
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(900));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1_000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.jittered_delay(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn total_latency_is_bounded() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100))
            .with_attempt_timeout(Some(Duration::from_secs(1)));
        assert_eq!(policy.max_total_latency(), Some(Duration::from_millis(3_200)));
        assert_eq!(policy.with_attempt_timeout(None).max_total_latency(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: jitter keeps the delay within the configured band.
        #[test]
        fn jitter_stays_within_band(
            attempt in 1u32..8,
            base_ms in 1u64..5_000,
            jitter in 0.0f64..1.0,
        ) {
            let policy = RetryPolicy::exponential(8, Duration::from_millis(base_ms), Duration::from_secs(60))
                .with_jitter(jitter);
            let nominal = policy.delay_for_attempt(attempt).as_millis() as f64;
            let actual = policy.jittered_delay(attempt).as_millis() as f64;
            prop_assert!(actual <= nominal * (1.0 + jitter) + 1.0);
            prop_assert!(actual >= nominal * (1.0 - jitter) - 1.0);
        }
    }
}
