//! Cross-cutting policy primitives.
//!
//! This module contains:
//! - `RetryPolicy` trait with linear, exponential-with-jitter, and no-retry
//!   implementations
//! - `CircuitBreaker`: per-error-category Closed/Open/HalfOpen admission
//! - `TokenBucket`: lazy-refill rate limiter with reject and queue behaviors
//! - Idempotency key strategies and the failure-caching classifier
//!
//! Policies hold the shared mutable state of the pipeline; decorators in
//! `crate::pipeline` apply them around handler invocations.

pub mod circuit_breaker;
pub mod idempotency;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState,
};
pub use idempotency::{FailureClassifier, IdempotencyKeyStrategy};
pub use rate_limit::{
    KeyedTokenBuckets, RateLimitBehavior, RateLimiterConfig, RateLimiterStats, TokenBucket,
};
pub use retry::{ExponentialBackoff, LinearRetry, NoRetry, RetryPolicy};
