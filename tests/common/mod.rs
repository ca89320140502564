//! Shared fixtures for integration tests.
//!
//! Each integration test binary compiles its own copy; not every fixture
//! is used from every binary.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use hero_messaging::message::Message;
use hero_messaging::transport::{
    AckDecision, ConsumerOptions, MessageConsumer, SubscriptionHandle, Transport, TransportError,
};

/// Transport that fails the first N publishes, then delivers into a
/// counter.
pub struct FlakyTransport {
    failures: AtomicUsize,
    pub published: AtomicUsize,
}

impl FlakyTransport {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            published: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn publish(
        &self,
        _destination: &str,
        _message: Arc<Message>,
    ) -> Result<(), TransportError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Publish("broker unavailable".into()));
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &self,
        _destination: &str,
        _consumer: Arc<dyn MessageConsumer>,
        _options: ConsumerOptions,
    ) -> Result<SubscriptionHandle, TransportError> {
        Err(TransportError::Subscribe("not supported".into()))
    }
}

/// Consumer that counts deliveries and acknowledges everything.
pub struct CountingConsumer {
    pub count: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageConsumer for CountingConsumer {
    async fn on_message(&self, _destination: &str, _message: Arc<Message>) -> AckDecision {
        self.count.fetch_add(1, Ordering::SeqCst);
        AckDecision::Ack
    }
}

/// Poll `condition` until it holds or ~1 second of real time elapses.
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
