//! Pipeline decorators.
//!
//! Each decorator is a `MessageProcessor` wrapping another. They share
//! policy state through `Arc`s but hold no mutable state of their own
//! between invocations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{MessageProcessor, ProcessingOutcome};
use crate::context::ProcessingContext;
use crate::error::ProcessingError;
use crate::message::Message;
use crate::observability::Observer;
use crate::policy::circuit_breaker::CircuitBreaker;
use crate::policy::idempotency::{FailureClassifier, IdempotencyKeyStrategy};
use crate::policy::rate_limit::{KeyedTokenBuckets, TokenBucket};
use crate::policy::retry::RetryPolicy;
use crate::storage::{IdempotencyStatus, IdempotencyStore};

/// Attribute under which the idempotency decorator publishes its key.
pub const IDEMPOTENCY_KEY_ATTRIBUTE: &str = "idempotency-key";

// ============================================================================
// Entry
// ============================================================================

/// Outermost decorator: tracing span, cancellation pre-check, and deadline
/// enforcement.
pub struct EntryDecorator {
    inner: Arc<dyn MessageProcessor>,
    timeout: Option<Duration>,
}

impl EntryDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, timeout: Option<Duration>) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl MessageProcessor for EntryDecorator {
    #[tracing::instrument(
        name = "pipeline.process",
        skip_all,
        fields(
            message_id = %ctx.message_id,
            message_type = %message.message_type,
            kind = %message.kind,
        )
    )]
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        ctx.check_cancelled()?;

        // Install the configured deadline unless the caller already set one.
        let ctx = if ctx.deadline.is_none() {
            match self.timeout {
                Some(timeout) => ctx.clone().with_timeout(timeout),
                None => ctx.clone(),
            }
        } else {
            ctx.clone()
        };

        let work = self.inner.process(&ctx, message);
        let result = match ctx.remaining_time() {
            Some(remaining) => {
                tokio::select! {
                    result = tokio::time::timeout(remaining, work) => {
                        result.unwrap_or(Err(ProcessingError::Timeout(remaining)))
                    }
                    _ = ctx.cancel.cancelled() => Err(ProcessingError::Cancelled),
                }
            }
            None => {
                tokio::select! {
                    result = work => result,
                    _ = ctx.cancel.cancelled() => Err(ProcessingError::Cancelled),
                }
            }
        };

        if let Err(error) = &result {
            debug!(
                category = %error.category(),
                correlation_id = ctx.correlation_id.as_deref().unwrap_or("-"),
                error = %error,
                "Processing failed"
            );
        }
        result
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Counts processed messages and records the handling duration.
pub struct MetricsDecorator {
    inner: Arc<dyn MessageProcessor>,
    observer: Arc<dyn Observer>,
}

impl MetricsDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, observer: Arc<dyn Observer>) -> Self {
        Self { inner, observer }
    }
}

#[async_trait]
impl MessageProcessor for MetricsDecorator {
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let started = std::time::Instant::now();
        let message_type = message.message_type.clone();
        let kind = message.kind;

        let mut span = self.observer.span_start("message.process");
        span.set_attribute("message_type", message_type.clone());

        let result = self.inner.process(ctx, message).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let outcome = match &result {
            Ok(_) => "success".to_string(),
            Err(error) => error.category().as_str().to_string(),
        };
        span.set_attribute("outcome", outcome.clone());
        span.stop();

        let tags = vec![
            ("kind", kind.to_string()),
            ("message_type", message_type),
            ("outcome", outcome),
        ];
        self.observer
            .counter("messages_processed_total", 1, tags.clone());
        self.observer
            .histogram("message_duration_ms", elapsed_ms, tags);

        result
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

/// Admission control around everything inside it. The inner retry loop is
/// one logical call: one success or one failure observation per invocation.
pub struct CircuitBreakerDecorator {
    inner: Arc<dyn MessageProcessor>,
    scope: String,
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerDecorator {
    pub fn new(
        inner: Arc<dyn MessageProcessor>,
        scope: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            inner,
            scope: scope.into(),
            breaker,
        }
    }
}

#[async_trait]
impl MessageProcessor for CircuitBreakerDecorator {
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        if !self.breaker.try_acquire() {
            return Err(ProcessingError::CircuitOpen(self.scope.clone()));
        }

        match self.inner.process(ctx, message).await {
            Ok(outcome) => {
                self.breaker.record_success();
                Ok(outcome)
            }
            Err(error) => {
                // Cancellation says nothing about downstream health.
                if !matches!(error, ProcessingError::Cancelled) {
                    self.breaker.record_failure(error.category());
                }
                Err(error)
            }
        }
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Attempt loop around the inner processor. Only retryable categories
/// re-enter; the delay between attempts races the cancellation token.
pub struct RetryDecorator {
    inner: Arc<dyn MessageProcessor>,
    policy: Arc<dyn RetryPolicy>,
}

impl RetryDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, policy: Arc<dyn RetryPolicy>) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl MessageProcessor for RetryDecorator {
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let mut attempt = 1u32;
        loop {
            ctx.check_cancelled()?;

            match self.inner.process(ctx, Arc::clone(&message)).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    if !self.policy.should_retry(&error, attempt) {
                        return Err(error);
                    }
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        message_id = %ctx.message_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after failure"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => return Err(ProcessingError::Cancelled),
                    }
                    attempt += 1;
                }
            }
        }
    }
}

// ============================================================================
// Rate limit
// ============================================================================

/// Global or per-scope bucket reference.
#[derive(Clone)]
pub enum RateLimiterHandle {
    Global(Arc<TokenBucket>),
    /// Scope resolved from a metadata key; messages without the key share
    /// the "default" scope.
    Keyed {
        buckets: Arc<KeyedTokenBuckets>,
        scope_key: String,
    },
}

/// Consumes one token per invocation before the inner call. Sits inside
/// the retry decorator so every retry attempt is gated.
pub struct RateLimitDecorator {
    inner: Arc<dyn MessageProcessor>,
    limiter: RateLimiterHandle,
}

impl RateLimitDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, limiter: RateLimiterHandle) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl MessageProcessor for RateLimitDecorator {
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let bucket = match &self.limiter {
            RateLimiterHandle::Global(bucket) => Arc::clone(bucket),
            RateLimiterHandle::Keyed { buckets, scope_key } => {
                let scope = message.metadata_value(scope_key).unwrap_or("default");
                buckets.bucket(scope)
            }
        };

        bucket.acquire(1, &ctx.cancel).await?;
        self.inner.process(ctx, message).await
    }
}

// ============================================================================
// Validation
// ============================================================================

/// A single validation rule over an incoming message.
pub trait MessageValidator: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, message: &Message) -> Result<(), ProcessingError>;
}

/// Baseline structural checks every pipeline runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WellFormedValidator;

impl MessageValidator for WellFormedValidator {
    fn name(&self) -> &'static str {
        "well-formed"
    }

    fn validate(&self, message: &Message) -> Result<(), ProcessingError> {
        if message.message_type.trim().is_empty() {
            return Err(ProcessingError::Validation(
                "message type must not be empty".to_string(),
            ));
        }
        if message.payload.is_null() {
            return Err(ProcessingError::Validation(format!(
                "'{}' carries a null payload",
                message.message_type
            )));
        }
        Ok(())
    }
}

/// Runs every registered validator before the inner call. Failures are
/// Validation errors and never retried.
pub struct ValidationDecorator {
    inner: Arc<dyn MessageProcessor>,
    validators: Vec<Arc<dyn MessageValidator>>,
}

impl ValidationDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, validators: Vec<Arc<dyn MessageValidator>>) -> Self {
        Self { inner, validators }
    }
}

#[async_trait]
impl MessageProcessor for ValidationDecorator {
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        for validator in &self.validators {
            validator.validate(&message).map_err(|error| {
                debug!(
                    validator = validator.name(),
                    message_id = %ctx.message_id,
                    error = %error,
                    "Validation rejected message"
                );
                match error {
                    ProcessingError::Validation(_) => error,
                    other => ProcessingError::Validation(other.to_string()),
                }
            })?;
        }
        self.inner.process(ctx, message).await
    }
}

// ============================================================================
// Idempotency
// ============================================================================

/// Idempotency decorator configuration.
#[derive(Clone)]
pub struct IdempotencyOptions {
    pub store: Arc<dyn IdempotencyStore>,
    pub strategy: IdempotencyKeyStrategy,
    pub classifier: FailureClassifier,
    pub ttl_success: Duration,
    pub ttl_failure: Duration,
    /// Failure caching is opt-in; the classifier still has the final word.
    pub cache_failures: bool,
}

impl IdempotencyOptions {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            strategy: IdempotencyKeyStrategy::default(),
            classifier: FailureClassifier::default(),
            ttl_success: Duration::from_secs(24 * 60 * 60),
            ttl_failure: Duration::from_secs(60 * 60),
            cache_failures: false,
        }
    }

    pub fn with_strategy(mut self, strategy: IdempotencyKeyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn caching_failures(mut self, classifier: FailureClassifier) -> Self {
        self.cache_failures = true;
        self.classifier = classifier;
        self
    }
}

/// Last check before the handler: replay a stored outcome when the key was
/// seen, otherwise run the handler once and store what happened.
pub struct IdempotencyDecorator {
    inner: Arc<dyn MessageProcessor>,
    options: IdempotencyOptions,
}

impl IdempotencyDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, options: IdempotencyOptions) -> Self {
        Self { inner, options }
    }
}

#[async_trait]
impl MessageProcessor for IdempotencyDecorator {
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let key = self.options.strategy.key_for(&message);
        ctx.set_attribute(IDEMPOTENCY_KEY_ATTRIBUTE, key.clone());

        let cached = self
            .options
            .store
            .get(&key)
            .await
            .map_err(|e| ProcessingError::Transient(format!("idempotency lookup: {}", e)))?;

        if let Some(response) = cached {
            return match response.status {
                IdempotencyStatus::Success => {
                    debug!(key = %key, "Replaying stored success");
                    Ok(ProcessingOutcome {
                        result: response.payload,
                    })
                }
                IdempotencyStatus::Failure => {
                    debug!(key = %key, "Replaying stored failure");
                    let category = response
                        .failure_category
                        .as_deref()
                        .and_then(crate::error::ErrorCategory::parse)
                        .unwrap_or(crate::error::ErrorCategory::Fatal);
                    Err(ProcessingError::from_category(
                        category,
                        response.failure_message.as_deref().unwrap_or("stored failure"),
                    ))
                }
            };
        }

        match self.inner.process(ctx, Arc::clone(&message)).await {
            Ok(outcome) => {
                if let Err(e) = self
                    .options
                    .store
                    .store_success(&key, outcome.result.clone(), self.options.ttl_success)
                    .await
                {
                    // The handler committed; a failed cache write only costs
                    // a possible re-execution on replay.
                    warn!(key = %key, error = %e, "Failed to store idempotent success");
                }
                Ok(outcome)
            }
            Err(error) => {
                if self.options.cache_failures && self.options.classifier.is_cacheable(&error) {
                    if let Err(e) = self
                        .options
                        .store
                        .store_failure(
                            &key,
                            error.category().as_str(),
                            &error.to_string(),
                            self.options.ttl_failure,
                        )
                        .await
                    {
                        warn!(key = %key, error = %e, "Failed to store idempotent failure");
                    }
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{make_command, FlakyProcessor};
    use crate::policy::rate_limit::{RateLimitBehavior, RateLimiterConfig};
    use crate::policy::retry::LinearRetry;
    use crate::storage::memory::InMemoryIdempotencyStore;

    fn ctx_for(message: &Message) -> ProcessingContext {
        ProcessingContext::for_message(message)
    }

    // ========================================================================
    // Retry
    // ========================================================================

    #[tokio::test]
    async fn test_retry_absorbs_transient_failures() {
        let handler = Arc::new(FlakyProcessor::failing_times(
            2,
            ProcessingError::Transient("nack".into()),
        ));
        let decorator = RetryDecorator::new(
            Arc::clone(&handler) as _,
            Arc::new(LinearRetry::new(5, Duration::from_millis(1))),
        );

        let message = Arc::new(make_command());
        let outcome = decorator.process(&ctx_for(&message), message).await;

        assert!(outcome.is_ok());
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_policy_budget() {
        let handler = Arc::new(FlakyProcessor::failing_times(
            10,
            ProcessingError::Transient("nack".into()),
        ));
        let decorator = RetryDecorator::new(
            Arc::clone(&handler) as _,
            Arc::new(LinearRetry::new(3, Duration::from_millis(1))),
        );

        let message = Arc::new(make_command());
        let err = decorator
            .process(&ctx_for(&message), message)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessingError::Transient(_)));
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_never_reenters_validation_failures() {
        let handler = Arc::new(FlakyProcessor::failing_times(
            10,
            ProcessingError::Validation("bad".into()),
        ));
        let decorator = RetryDecorator::new(
            Arc::clone(&handler) as _,
            Arc::new(LinearRetry::new(5, Duration::from_millis(1))),
        );

        let message = Arc::new(make_command());
        let err = decorator
            .process(&ctx_for(&message), message)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessingError::Validation(_)));
        assert_eq!(handler.call_count(), 1);
    }

    // ========================================================================
    // Circuit breaker
    // ========================================================================

    #[tokio::test]
    async fn test_breaker_rejects_after_threshold() {
        let breaker = Arc::new(CircuitBreaker::new(
            crate::policy::circuit_breaker::CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        ));
        let handler = Arc::new(FlakyProcessor::failing_times(
            100,
            ProcessingError::Transient("down".into()),
        ));
        let decorator = CircuitBreakerDecorator::new(
            Arc::clone(&handler) as _,
            "orders",
            Arc::clone(&breaker),
        );

        let message = Arc::new(make_command());
        for _ in 0..2 {
            let _ = decorator
                .process(&ctx_for(&message), Arc::clone(&message))
                .await;
        }

        let err = decorator
            .process(&ctx_for(&message), message)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::CircuitOpen(_)));
        // The rejected call never reached the handler.
        assert_eq!(handler.call_count(), 2);
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[tokio::test]
    async fn test_validation_rejects_before_handler() {
        let handler = Arc::new(FlakyProcessor::succeeding());
        let decorator = ValidationDecorator::new(
            Arc::clone(&handler) as _,
            vec![Arc::new(WellFormedValidator)],
        );

        let mut bad = make_command();
        bad.payload = serde_json::Value::Null;
        let bad = Arc::new(bad);

        let err = decorator
            .process(&ctx_for(&bad), bad)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Validation(_)));
        assert_eq!(handler.call_count(), 0);
    }

    // ========================================================================
    // Rate limit
    // ========================================================================

    #[tokio::test]
    async fn test_rate_limit_rejects_over_burst() {
        let bucket = Arc::new(TokenBucket::new(RateLimiterConfig {
            capacity: 2,
            refill_rate: 0.001,
            behavior: RateLimitBehavior::Reject,
            ..Default::default()
        }));
        let handler = Arc::new(FlakyProcessor::succeeding());
        let decorator = RateLimitDecorator::new(
            Arc::clone(&handler) as _,
            RateLimiterHandle::Global(bucket),
        );

        let message = Arc::new(make_command());
        for _ in 0..2 {
            decorator
                .process(&ctx_for(&message), Arc::clone(&message))
                .await
                .unwrap();
        }
        let err = decorator
            .process(&ctx_for(&message), message)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessingError::RateLimited(_)));
        assert_eq!(handler.call_count(), 2);
    }

    #[tokio::test]
    async fn test_keyed_rate_limit_scopes_by_metadata() {
        let buckets = Arc::new(KeyedTokenBuckets::new(RateLimiterConfig {
            capacity: 1,
            refill_rate: 0.001,
            behavior: RateLimitBehavior::Reject,
            ..Default::default()
        }));
        let handler = Arc::new(FlakyProcessor::succeeding());
        let decorator = RateLimitDecorator::new(
            Arc::clone(&handler) as _,
            RateLimiterHandle::Keyed {
                buckets,
                scope_key: "tenant".to_string(),
            },
        );

        let acme = Arc::new(make_command().with_metadata("tenant", "acme"));
        let umbrella = Arc::new(make_command().with_metadata("tenant", "umbrella"));

        decorator
            .process(&ctx_for(&acme), Arc::clone(&acme))
            .await
            .unwrap();
        // Distinct scope still has its token.
        decorator
            .process(&ctx_for(&umbrella), umbrella)
            .await
            .unwrap();
        // Same scope is drained.
        let err = decorator.process(&ctx_for(&acme), acme).await.unwrap_err();
        assert!(matches!(err, ProcessingError::RateLimited(_)));
    }

    // ========================================================================
    // Idempotency
    // ========================================================================

    #[tokio::test]
    async fn test_idempotency_replays_success_without_handler() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let handler = Arc::new(FlakyProcessor::succeeding());
        let decorator = IdempotencyDecorator::new(
            Arc::clone(&handler) as _,
            IdempotencyOptions::new(store),
        );

        let message = Arc::new(make_command());
        let first = decorator
            .process(&ctx_for(&message), Arc::clone(&message))
            .await
            .unwrap();
        let second = decorator
            .process(&ctx_for(&message), message)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_publishes_key_attribute() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let decorator = IdempotencyDecorator::new(
            Arc::new(FlakyProcessor::succeeding()),
            IdempotencyOptions::new(store),
        );

        let message = Arc::new(make_command());
        let ctx = ctx_for(&message);
        decorator.process(&ctx, Arc::clone(&message)).await.unwrap();

        assert_eq!(
            ctx.attribute(IDEMPOTENCY_KEY_ATTRIBUTE),
            Some(message.id.to_string())
        );
    }

    #[tokio::test]
    async fn test_idempotency_caches_classified_failures_only() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let handler = Arc::new(FlakyProcessor::failing_times(
            100,
            ProcessingError::Validation("total must be positive".into()),
        ));
        let decorator = IdempotencyDecorator::new(
            Arc::clone(&handler) as _,
            IdempotencyOptions::new(store).caching_failures(FailureClassifier::default()),
        );

        let message = Arc::new(make_command());
        let first = decorator
            .process(&ctx_for(&message), Arc::clone(&message))
            .await
            .unwrap_err();
        let second = decorator
            .process(&ctx_for(&message), message)
            .await
            .unwrap_err();

        assert!(matches!(first, ProcessingError::Validation(_)));
        assert!(matches!(second, ProcessingError::Validation(_)));
        // The second failure came from the cache, not the handler.
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_never_caches_transient_failures() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let handler = Arc::new(FlakyProcessor::failing_times(
            100,
            ProcessingError::Transient("timeout".into()),
        ));
        let decorator = IdempotencyDecorator::new(
            Arc::clone(&handler) as _,
            IdempotencyOptions::new(store).caching_failures(FailureClassifier::default()),
        );

        let message = Arc::new(make_command());
        for _ in 0..2 {
            let _ = decorator
                .process(&ctx_for(&message), Arc::clone(&message))
                .await;
        }

        // Both invocations reached the handler.
        assert_eq!(handler.call_count(), 2);
    }

    // ========================================================================
    // Entry
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_entry_enforces_deadline() {
        struct SlowProcessor;

        #[async_trait]
        impl MessageProcessor for SlowProcessor {
            async fn process(
                &self,
                _ctx: &ProcessingContext,
                _message: Arc<Message>,
            ) -> Result<ProcessingOutcome, ProcessingError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ProcessingOutcome::empty())
            }
        }

        let decorator =
            EntryDecorator::new(Arc::new(SlowProcessor), Some(Duration::from_millis(50)));
        let message = Arc::new(make_command());

        let err = decorator
            .process(&ctx_for(&message), message)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_entry_observes_pre_cancelled_context() {
        let handler = Arc::new(FlakyProcessor::succeeding());
        let decorator = EntryDecorator::new(Arc::clone(&handler) as _, None);

        let message = Arc::new(make_command());
        let ctx = ctx_for(&message);
        ctx.cancel.cancel();

        let err = decorator.process(&ctx, message).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Cancelled));
        assert_eq!(handler.call_count(), 0);
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    #[tokio::test]
    async fn test_metrics_decorator_records_outcome() {
        use crate::observability::RecordingObserver;

        let observer = RecordingObserver::new();
        let decorator = MetricsDecorator::new(
            Arc::new(FlakyProcessor::succeeding()),
            Arc::new(observer.clone()),
        );

        let message = Arc::new(make_command());
        decorator.process(&ctx_for(&message), message).await.unwrap();

        assert_eq!(observer.counter_value("messages_processed_total"), 1);
        assert_eq!(observer.histogram_samples("message_duration_ms").len(), 1);
        assert_eq!(observer.spans().len(), 1);
    }
}
