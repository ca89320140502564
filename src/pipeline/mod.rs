//! Processing pipeline.
//!
//! This module contains:
//! - `MessageProcessor` trait: the single seam everything composes over
//! - Decorators applying the cross-cutting policies around a processor
//! - `CommandProcessor` / `QueryProcessor` / `EventDispatcher` dispatching
//!   on top of the chain
//!
//! The chain is built outside-in. Canonical order, innermost to outermost:
//! handler, idempotency, validation, rate limit, retry, circuit breaker,
//! metrics, entry. Rate limiting gates retry bursts, the breaker sees the
//! result of all retries as one logical call, and idempotency is the last
//! check before the handler so retries cannot double-commit.

pub mod command;
pub mod decorators;
pub mod event;
pub mod handlers;
pub mod query;

pub use command::CommandProcessor;
pub use decorators::{
    CircuitBreakerDecorator, EntryDecorator, IdempotencyDecorator, IdempotencyOptions,
    MessageValidator, MetricsDecorator, RateLimitDecorator, RateLimiterHandle, RetryDecorator,
    ValidationDecorator, WellFormedValidator,
};
pub use event::{DispatchPolicy, EventDispatchReport, EventDispatcher, FailurePolicy};
pub use handlers::{
    CommandHandler, CommandInvoker, EventHandler, EventHandlerInvoker, HandlerRegistry,
    QueryHandler, QueryInvoker,
};
pub use query::QueryProcessor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::ProcessingContext;
use crate::error::ProcessingError;
use crate::message::Message;
use crate::observability::Observer;
use crate::policy::circuit_breaker::CircuitBreaker;
use crate::policy::retry::RetryPolicy;

/// Result of one processed message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingOutcome {
    /// Command results are optional, query results always present, event
    /// outcomes empty.
    pub result: Option<serde_json::Value>,
}

impl ProcessingOutcome {
    pub fn empty() -> Self {
        Self { result: None }
    }

    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
        }
    }
}

/// A processor takes a context and a message and produces an outcome.
/// Decorators are processors wrapping another processor.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError>;
}

/// Everything needed to assemble the canonical decorator chain. Policy
/// state (breaker, buckets, stores) is shared; the chain itself holds no
/// mutable state between invocations.
#[derive(Clone, Default)]
pub struct ChainOptions {
    /// Per-invocation deadline applied by the entry decorator.
    pub timeout: Option<Duration>,
    /// Metrics sink; absent means no metrics decorator.
    pub observer: Option<Arc<dyn Observer>>,
    /// Circuit breaker with its scope label.
    pub circuit_breaker: Option<(String, Arc<CircuitBreaker>)>,
    pub retry: Option<Arc<dyn RetryPolicy>>,
    pub rate_limiter: Option<RateLimiterHandle>,
    pub validators: Vec<Arc<dyn MessageValidator>>,
    pub idempotency: Option<IdempotencyOptions>,
}

/// Wrap a handler-invoking processor in the canonical decorator chain.
pub fn build_chain(
    handler: Arc<dyn MessageProcessor>,
    options: &ChainOptions,
) -> Arc<dyn MessageProcessor> {
    let mut processor = handler;

    if let Some(idempotency) = &options.idempotency {
        processor = Arc::new(IdempotencyDecorator::new(processor, idempotency.clone()));
    }
    if !options.validators.is_empty() {
        processor = Arc::new(ValidationDecorator::new(
            processor,
            options.validators.clone(),
        ));
    }
    if let Some(limiter) = &options.rate_limiter {
        processor = Arc::new(RateLimitDecorator::new(processor, limiter.clone()));
    }
    if let Some(retry) = &options.retry {
        processor = Arc::new(RetryDecorator::new(processor, Arc::clone(retry)));
    }
    if let Some((scope, breaker)) = &options.circuit_breaker {
        processor = Arc::new(CircuitBreakerDecorator::new(
            processor,
            scope.clone(),
            Arc::clone(breaker),
        ));
    }
    if let Some(observer) = &options.observer {
        processor = Arc::new(MetricsDecorator::new(processor, Arc::clone(observer)));
    }
    Arc::new(EntryDecorator::new(processor, options.timeout))
}
