//! Pipeline integration: rate-limited bursts and idempotent replay
//! through the full command chain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use hero_messaging::context::ProcessingContext;
use hero_messaging::error::ProcessingError;
use hero_messaging::message::Message;
use hero_messaging::pipeline::decorators::RateLimiterHandle;
use hero_messaging::pipeline::handlers::{CommandHandler, HandlerRegistry};
use hero_messaging::pipeline::{ChainOptions, CommandProcessor, IdempotencyOptions};
use hero_messaging::policy::rate_limit::{RateLimitBehavior, RateLimiterConfig, TokenBucket};
use hero_messaging::storage::memory::InMemoryIdempotencyStore;
use tokio::time::Instant;

struct CountingHandler {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandler for CountingHandler {
    async fn handle(
        &self,
        _ctx: &ProcessingContext,
        message: &Message,
    ) -> Result<Option<serde_json::Value>, ProcessingError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(Some(serde_json::json!({
            "accepted": message.payload["order_id"],
        })))
    }
}

fn make_registry(count: &Arc<AtomicUsize>) -> Arc<HandlerRegistry> {
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register_command(
            "orders.PlaceOrder",
            Arc::new(CountingHandler {
                count: Arc::clone(count),
            }),
        )
        .unwrap();
    registry
}

fn place_order(order_id: &str) -> Message {
    Message::command("orders.PlaceOrder", &serde_json::json!({"order_id": order_id})).unwrap()
}

/// Ten acquires against a capacity-5 bucket in one tick: exactly five
/// succeed. Three seconds of refill at 1 token/s buys exactly three more.
#[tokio::test(start_paused = true)]
async fn test_rate_limited_burst_then_refill() {
    let bucket = Arc::new(TokenBucket::new(RateLimiterConfig {
        capacity: 5,
        refill_rate: 1.0,
        behavior: RateLimitBehavior::Reject,
        ..Default::default()
    }));

    let count = Arc::new(AtomicUsize::new(0));
    let processor = CommandProcessor::new(
        make_registry(&count),
        &ChainOptions {
            rate_limiter: Some(RateLimiterHandle::Global(Arc::clone(&bucket))),
            ..Default::default()
        },
    );

    let mut granted = 0;
    let mut throttled = 0;
    for i in 0..10 {
        match processor.send(place_order(&format!("O{}", i))).await {
            Ok(_) => granted += 1,
            Err(ProcessingError::RateLimited(_)) => throttled += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(granted, 5);
    assert_eq!(throttled, 5);
    assert_eq!(count.load(Ordering::SeqCst), 5);

    tokio::time::advance(Duration::from_secs(3)).await;
    for i in 0..3 {
        processor
            .send(place_order(&format!("R{}", i)))
            .await
            .unwrap();
    }
    assert_eq!(count.load(Ordering::SeqCst), 8);
    // The refill bought exactly three.
    assert!(!bucket.try_acquire_at(1, Instant::now()));
}

/// Replaying the same command id runs the handler once; the second send
/// returns the stored result without an invocation.
#[tokio::test]
async fn test_idempotent_replay_returns_stored_result() {
    let count = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let processor = CommandProcessor::new(
        make_registry(&count),
        &ChainOptions {
            idempotency: Some(IdempotencyOptions::new(store)),
            ..Default::default()
        },
    );

    let command = place_order("X");
    let replay = command.clone();

    let first = processor.send(command).await.unwrap().unwrap();
    assert_eq!(first["accepted"], "X");
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let second = processor.send(replay).await.unwrap().unwrap();
    assert_eq!(second, first);
    // Side effect happened exactly once.
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

/// A fresh message id is a fresh key: the handler runs again.
#[tokio::test]
async fn test_distinct_ids_are_distinct_keys() {
    let count = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let processor = CommandProcessor::new(
        make_registry(&count),
        &ChainOptions {
            idempotency: Some(IdempotencyOptions::new(store)),
            ..Default::default()
        },
    );

    processor.send(place_order("X")).await.unwrap();
    processor.send(place_order("X")).await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 2);
}

/// The full standard chain composes: a handler flapping with transient
/// failures is retried, and the eventual success is cached for replay.
#[tokio::test]
async fn test_retry_and_idempotency_compose() {
    use hero_messaging::policy::retry::LinearRetry;

    struct FlappingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler for FlappingHandler {
        async fn handle(
            &self,
            _ctx: &ProcessingContext,
            _message: &Message,
        ) -> Result<Option<serde_json::Value>, ProcessingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < 2 {
                Err(ProcessingError::Transient("warming up".into()))
            } else {
                Ok(Some(serde_json::json!({"ready": true})))
            }
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register_command(
            "orders.PlaceOrder",
            Arc::new(FlappingHandler {
                calls: Arc::clone(&calls),
            }),
        )
        .unwrap();

    let processor = CommandProcessor::new(
        registry,
        &ChainOptions {
            retry: Some(Arc::new(LinearRetry::new(5, Duration::from_millis(1)))),
            idempotency: Some(IdempotencyOptions::new(Arc::new(
                InMemoryIdempotencyStore::new(),
            ))),
            ..Default::default()
        },
    );

    let command = place_order("X");
    let replay = command.clone();

    let result = processor.send(command).await.unwrap().unwrap();
    assert_eq!(result["ready"], true);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Replay hits the cache; the handler is not consulted again.
    let replayed = processor.send(replay).await.unwrap().unwrap();
    assert_eq!(replayed, result);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
