//! Outbox relay worker.
//!
//! Polls the outbox store for eligible entries, claims each with a
//! compare-and-swap, and publishes to the transport. Entries are grouped
//! per destination: within a destination, dispatch is single-flight in
//! priority-then-FIFO order; distinct destinations relay concurrently with
//! no order between them. State commits per entry, so a crash mid-batch
//! loses at most one entry's transition, recovered on the next poll.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{OutboxEntry, OutboxRelayConfig};
use crate::message::Message;
use crate::policy::retry::RetryPolicy;
use crate::storage::{
    EnqueueOptions, OutboxStore, QueueStore, Result, DEAD_LETTER_ERROR, DEAD_LETTER_ORIGIN,
    DEAD_LETTER_QUEUE,
};
use crate::transport::Transport;
use crate::worker::WorkerHandle;

/// Background relay between the outbox store and the transport.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn Transport>,
    dead_letters: Arc<dyn QueueStore>,
    config: OutboxRelayConfig,
    retry_policy: Arc<dyn RetryPolicy>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn Transport>,
        dead_letters: Arc<dyn QueueStore>,
        config: OutboxRelayConfig,
    ) -> Self {
        let retry_policy = config.retry.build();
        Self {
            store,
            transport,
            dead_letters,
            config,
            retry_policy,
        }
    }

    /// Append a Pending entry with the relay's retry budget.
    ///
    /// When the store supports transactions, callers enlist the append in
    /// the same transaction as their business writes by using the store
    /// directly; this helper covers the plain case.
    pub async fn enqueue(
        &self,
        message: Message,
        destination: &str,
        priority: i32,
    ) -> Result<Uuid> {
        let entry = OutboxEntry::new(message, destination, priority)
            .with_max_retries(self.config.max_retries);
        let id = entry.id;
        self.store.add(entry).await?;
        debug!(entry_id = %id, destination = %destination, "Outbox entry enqueued");
        Ok(id)
    }

    /// Entries not yet terminally resolved.
    pub async fn pending_count(&self) -> Result<usize> {
        self.store.pending_count().await
    }

    /// One poll cycle: fetch the eligible batch and relay it. Returns how
    /// many entries were delivered.
    pub async fn drain_once(&self) -> Result<usize> {
        let batch = self.store.get_pending(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        // Group per destination, keeping the store's priority-then-FIFO
        // order within each group.
        let mut groups: Vec<(String, Vec<OutboxEntry>)> = Vec::new();
        for entry in batch {
            match groups
                .iter_mut()
                .find(|(destination, _)| *destination == entry.destination)
            {
                Some((_, entries)) => entries.push(entry),
                None => groups.push((entry.destination.clone(), vec![entry])),
            }
        }

        let delivered = join_all(
            groups
                .into_iter()
                .map(|(destination, entries)| self.relay_destination(destination, entries)),
        )
        .await
        .into_iter()
        .sum();

        Ok(delivered)
    }

    async fn relay_destination(&self, destination: String, entries: Vec<OutboxEntry>) -> usize {
        let mut delivered = 0;
        for entry in entries {
            match self.relay_entry(entry).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(destination = %destination, error = %e, "Outbox state update failed");
                }
            }
        }
        delivered
    }

    /// Relay one entry. Returns true when it was delivered and marked
    /// processed.
    async fn relay_entry(&self, entry: OutboxEntry) -> Result<bool> {
        // Claim; another worker may have won.
        if !self.store.mark_processing(entry.id).await? {
            debug!(entry_id = %entry.id, "Entry already claimed, skipping");
            return Ok(false);
        }

        let message = Arc::new(entry.message.clone());
        match self.transport.publish(&entry.destination, message).await {
            Ok(()) => {
                self.store.mark_processed(entry.id).await?;
                debug!(
                    entry_id = %entry.id,
                    destination = %entry.destination,
                    "Outbox entry delivered"
                );
                Ok(true)
            }
            Err(e) => {
                let error = e.to_string();
                if entry.retry_count >= entry.max_retries {
                    warn!(
                        entry_id = %entry.id,
                        destination = %entry.destination,
                        retry_count = entry.retry_count,
                        error = %error,
                        "Retries exhausted, dead-lettering entry"
                    );
                    self.store.mark_failed(entry.id, &error).await?;
                    self.dead_letter(&entry, &error).await;
                } else {
                    let attempt = entry.retry_count + 1;
                    let delay = self.retry_policy.delay_for(attempt);
                    let next_retry_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(1));
                    warn!(
                        entry_id = %entry.id,
                        destination = %entry.destination,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Publish failed, deferring retry"
                    );
                    self.store
                        .update_retry(entry.id, attempt, next_retry_at, &error)
                        .await?;
                }
                Ok(false)
            }
        }
    }

    /// Copy an exhausted entry onto the shared dead-letter queue.
    async fn dead_letter(&self, entry: &OutboxEntry, error: &str) {
        let copy = entry
            .message
            .clone()
            .with_metadata(DEAD_LETTER_ORIGIN, entry.destination.clone())
            .with_metadata(DEAD_LETTER_ERROR, error);

        if let Err(e) = self
            .dead_letters
            .enqueue(DEAD_LETTER_QUEUE, copy, EnqueueOptions::default())
            .await
        {
            error!(entry_id = %entry.id, error = %e, "Failed to dead-letter outbox entry");
        }
    }

    /// Spawn the polling loop. An in-flight drain always finishes its
    /// per-entry state commits before the worker observes the stop signal.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let relay = self;
        let cadence = Duration::from_millis(relay.config.poll_interval_ms.max(1));

        WorkerHandle::spawn("outbox-relay", move |mut stop| async move {
            let mut ticker = interval(cadence);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match relay.drain_once().await {
                            Ok(0) => {}
                            Ok(delivered) => {
                                info!(delivered, "Outbox relay delivered entries");
                            }
                            Err(e) => error!(error = %e, "Outbox relay poll failed"),
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::retry::{RetryConfig, RetryStrategy};
    use crate::storage::memory::{InMemoryOutboxStore, InMemoryQueueStore};
    use crate::transport::{ChannelTransport, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that fails the first N publishes.
    struct FlakyTransport {
        failures: AtomicUsize,
        published: AtomicUsize,
    }

    impl FlakyTransport {
        fn failing(failures: usize) -> Self {
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
        ) -> crate::transport::Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
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
            _consumer: Arc<dyn crate::transport::MessageConsumer>,
            _options: crate::transport::ConsumerOptions,
        ) -> crate::transport::Result<crate::transport::SubscriptionHandle> {
            Err(TransportError::Subscribe("not supported".into()))
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            strategy: RetryStrategy::Linear,
            max_attempts: 10,
            base_delay_ms: 0,
            ..Default::default()
        }
    }

    fn make_message() -> Message {
        Message::event("orders.OrderPlaced", &serde_json::json!({"order_id": "O1"})).unwrap()
    }

    #[tokio::test]
    async fn test_drain_delivers_and_marks_processed() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let transport = Arc::new(ChannelTransport::new());
        let relay = OutboxRelay::new(
            Arc::clone(&store) as _,
            transport,
            Arc::new(InMemoryQueueStore::new()),
            OutboxRelayConfig {
                retry: fast_retry(),
                ..Default::default()
            },
        );

        let id = relay.enqueue(make_message(), "orders", 0).await.unwrap();
        assert_eq!(relay.drain_once().await.unwrap(), 1);

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, crate::outbox::OutboxStatus::Processed);
        assert!(entry.processed_at.is_some());
        assert_eq!(relay.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_defers_with_retry_count() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let transport = Arc::new(FlakyTransport::failing(1));
        let relay = OutboxRelay::new(
            Arc::clone(&store) as _,
            Arc::clone(&transport) as _,
            Arc::new(InMemoryQueueStore::new()),
            OutboxRelayConfig {
                retry: fast_retry(),
                max_retries: 3,
                ..Default::default()
            },
        );

        let id = relay.enqueue(make_message(), "orders", 0).await.unwrap();
        assert_eq!(relay.drain_once().await.unwrap(), 0);

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, crate::outbox::OutboxStatus::Pending);
        assert_eq!(entry.retry_count, 1);
        assert!(entry.next_retry_at.is_some());
        assert!(entry.last_error.is_some());

        // Zero base delay: immediately eligible again, now succeeding.
        assert_eq!(relay.drain_once().await.unwrap(), 1);
        assert_eq!(transport.published.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_entry_fails_and_dead_letters() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let dead_letters = Arc::new(InMemoryQueueStore::new());
        let transport = Arc::new(FlakyTransport::failing(usize::MAX));
        let relay = OutboxRelay::new(
            Arc::clone(&store) as _,
            transport,
            Arc::clone(&dead_letters) as _,
            OutboxRelayConfig {
                retry: fast_retry(),
                max_retries: 2,
                ..Default::default()
            },
        );

        let id = relay.enqueue(make_message(), "orders", 0).await.unwrap();
        for _ in 0..3 {
            relay.drain_once().await.unwrap();
        }

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, crate::outbox::OutboxStatus::Failed);
        assert_eq!(entry.retry_count, 2);
        assert_eq!(dead_letters.depth(DEAD_LETTER_QUEUE).await.unwrap(), 1);

        let dead = dead_letters
            .dequeue(DEAD_LETTER_QUEUE, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            dead.message.metadata_value(DEAD_LETTER_ORIGIN),
            Some("orders")
        );
    }

    #[tokio::test]
    async fn test_destinations_relay_independently() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let transport = Arc::new(ChannelTransport::new());
        let relay = OutboxRelay::new(
            Arc::clone(&store) as _,
            transport,
            Arc::new(InMemoryQueueStore::new()),
            OutboxRelayConfig {
                retry: fast_retry(),
                ..Default::default()
            },
        );

        relay.enqueue(make_message(), "orders", 0).await.unwrap();
        relay.enqueue(make_message(), "billing", 1).await.unwrap();
        relay.enqueue(make_message(), "orders", 2).await.unwrap();

        assert_eq!(relay.drain_once().await.unwrap(), 3);
        assert_eq!(relay.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_relay_polls_until_stopped() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let transport = Arc::new(ChannelTransport::new());
        let relay = Arc::new(OutboxRelay::new(
            Arc::clone(&store) as _,
            transport,
            Arc::new(InMemoryQueueStore::new()),
            OutboxRelayConfig {
                poll_interval_ms: 10,
                retry: fast_retry(),
                ..Default::default()
            },
        ));

        let handle = Arc::clone(&relay).spawn();
        relay.enqueue(make_message(), "orders", 0).await.unwrap();

        for _ in 0..100 {
            if relay.pending_count().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(relay.pending_count().await.unwrap(), 0);
        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }
}
