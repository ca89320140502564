//! Retry policies.
//!
//! A policy answers two questions: may attempt N be retried after this
//! error, and how long to wait before the next attempt. Attempts are
//! 1-based; `should_retry` is asked with the number of the attempt that
//! just failed.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::error::ProcessingError;

/// Capability set for retry decisions.
pub trait RetryPolicy: Send + Sync {
    /// Whether another attempt may follow after `attempt` failed with
    /// `error`. Non-retryable error categories always stop the loop.
    fn should_retry(&self, error: &ProcessingError, attempt: u32) -> bool;

    /// Delay before the attempt following `attempt`.
    fn delay_for(&self, attempt: u32) -> Duration;
}

/// Policy that never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _error: &ProcessingError, _attempt: u32) -> bool {
        false
    }

    fn delay_for(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Fixed delay with a cap on attempts.
#[derive(Debug, Clone)]
pub struct LinearRetry {
    max_attempts: u32,
    delay: Duration,
}

impl LinearRetry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl RetryPolicy for LinearRetry {
    fn should_retry(&self, error: &ProcessingError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    fn delay_for(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Exponential backoff with uniform jitter.
///
/// `delay = base * 2^(attempt-1)`, capped at `max_delay`, then spread by
/// up to `jitter` in either direction.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: Duration::ZERO,
        }
    }

    /// Add uniform jitter of up to `jitter` around each delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before jitter is applied. Monotone non-decreasing in the
    /// attempt number.
    pub fn raw_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let multiplier = 2u64.checked_pow(exponent.min(63)).unwrap_or(u64::MAX);
        self.base_delay
            .checked_mul(multiplier.min(u32::MAX as u64) as u32)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, error: &ProcessingError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay_for(attempt);
        if self.jitter.is_zero() {
            return raw;
        }

        let jitter_us = self.jitter.as_micros() as i64;
        let offset = rand::rng().random_range(-jitter_us..=jitter_us);
        let raw_us = raw.as_micros() as i64;
        Duration::from_micros(raw_us.saturating_add(offset).max(0) as u64)
    }
}

/// Retry strategy discriminator for configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    None,
    Linear,
    #[default]
    Exponential,
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Strategy discriminator.
    pub strategy: RetryStrategy,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds (exponential only).
    pub max_delay_ms: u64,
    /// Uniform jitter in milliseconds (exponential only).
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter_ms: 0,
        }
    }
}

impl RetryConfig {
    /// Build the configured policy.
    pub fn build(&self) -> std::sync::Arc<dyn RetryPolicy> {
        match self.strategy {
            RetryStrategy::None => std::sync::Arc::new(NoRetry),
            RetryStrategy::Linear => std::sync::Arc::new(LinearRetry::new(
                self.max_attempts,
                Duration::from_millis(self.base_delay_ms),
            )),
            RetryStrategy::Exponential => std::sync::Arc::new(
                ExponentialBackoff::new(
                    self.max_attempts,
                    Duration::from_millis(self.base_delay_ms),
                    Duration::from_millis(self.max_delay_ms),
                )
                .with_jitter(Duration::from_millis(self.jitter_ms)),
            ),
        }
    }
}
