//! In-memory channel transport.
//!
//! Per-destination tokio mpsc queues with one consumer pump per
//! destination. Messages published before a consumer attaches are buffered.
//! Prefetch above one fans handling out to concurrent tasks bounded by a
//! semaphore; prefetch of one processes sequentially and preserves order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tracing::{debug, info, warn};

use super::{
    AckDecision, ConsumerOptions, MessageConsumer, Result, SubscriptionHandle, Transport,
    TransportError,
};
use crate::message::Message;
use crate::storage::{DEAD_LETTER_ERROR, DEAD_LETTER_ORIGIN, DEAD_LETTER_QUEUE};
use crate::worker::WorkerHandle;

struct Destination {
    sender: mpsc::UnboundedSender<Arc<Message>>,
    /// Taken by the first subscriber's pump.
    receiver: Option<mpsc::UnboundedReceiver<Arc<Message>>>,
}

impl Destination {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// In-process transport on tokio channels.
#[derive(Default)]
pub struct ChannelTransport {
    destinations: Arc<RwLock<HashMap<String, Destination>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, destination: &str) -> mpsc::UnboundedSender<Arc<Message>> {
        let mut destinations = self.destinations.write().await;
        destinations
            .entry(destination.to_string())
            .or_insert_with(Destination::new)
            .sender
            .clone()
    }

    fn dead_letter_copy(destination: &str, message: &Message) -> Message {
        message
            .clone()
            .with_metadata(DEAD_LETTER_ORIGIN, destination)
            .with_metadata(DEAD_LETTER_ERROR, "consumer dead-lettered")
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn publish(&self, destination: &str, message: Arc<Message>) -> Result<()> {
        let sender = self.sender_for(destination).await;
        sender
            .send(message)
            .map_err(|_| TransportError::Publish(format!("destination '{}' closed", destination)))?;
        debug!(destination = %destination, "Message published to channel");
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        consumer: Arc<dyn MessageConsumer>,
        options: ConsumerOptions,
    ) -> Result<SubscriptionHandle> {
        let mut receiver = {
            let mut destinations = self.destinations.write().await;
            let entry = destinations
                .entry(destination.to_string())
                .or_insert_with(Destination::new);
            entry
                .receiver
                .take()
                .ok_or_else(|| TransportError::AlreadySubscribed(destination.to_string()))?
        };

        let (paused_tx, paused_rx) = watch::channel(false);
        let destination_name = destination.to_string();
        let requeue_sender = self.sender_for(destination).await;
        let dead_letter_sender = self.sender_for(DEAD_LETTER_QUEUE).await;
        let prefetch = options.prefetch.max(1);
        let permits = Arc::new(Semaphore::new(prefetch));

        info!(
            destination = %destination_name,
            prefetch,
            auto_ack = options.auto_ack,
            "Channel consumer started"
        );

        let worker = WorkerHandle::spawn("channel-consumer", move |mut stop| async move {
            let mut paused = paused_rx;
            loop {
                // Hold delivery while paused.
                while *paused.borrow() {
                    tokio::select! {
                        changed = paused.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                return;
                            }
                        }
                    }
                }

                let message = tokio::select! {
                    received = receiver.recv() => match received {
                        Some(message) => message,
                        None => {
                            info!(destination = %destination_name, "Channel closed, stopping consumer");
                            return;
                        }
                    },
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                        continue;
                    }
                };

                // Pause may have been signalled while waiting for the
                // message; hold it here rather than dispatching.
                while *paused.borrow() {
                    tokio::select! {
                        changed = paused.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                return;
                            }
                        }
                    }
                }

                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let consumer = Arc::clone(&consumer);
                let destination = destination_name.clone();
                let requeue = requeue_sender.clone();
                let dead_letter = dead_letter_sender.clone();
                let auto_ack = options.auto_ack;

                let handle_one = async move {
                    let _permit = permit;
                    let decision = consumer.on_message(&destination, Arc::clone(&message)).await;
                    if auto_ack {
                        return;
                    }
                    match decision {
                        AckDecision::Ack => {}
                        AckDecision::Requeue => {
                            debug!(destination = %destination, message_id = %message.id, "Requeueing message");
                            let _ = requeue.send(message);
                        }
                        AckDecision::DeadLetter => {
                            warn!(destination = %destination, message_id = %message.id, "Dead-lettering message");
                            let copy = ChannelTransport::dead_letter_copy(&destination, &message);
                            let _ = dead_letter.send(Arc::new(copy));
                        }
                    }
                };

                if prefetch == 1 {
                    // Sequential delivery preserves per-destination order.
                    handle_one.await;
                } else {
                    tokio::spawn(handle_one);
                }
            }
        });

        Ok(SubscriptionHandle::new(paused_tx, worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct CountingConsumer {
        count: Arc<AtomicUsize>,
        decision: AckDecision,
    }

    #[async_trait]
    impl MessageConsumer for CountingConsumer {
        async fn on_message(&self, _destination: &str, _message: Arc<Message>) -> AckDecision {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.decision
        }
    }

    struct ClosureConsumer<F>(F);

    #[async_trait]
    impl<F> MessageConsumer for ClosureConsumer<F>
    where
        F: Fn(Arc<Message>) -> BoxFuture<'static, AckDecision> + Send + Sync,
    {
        async fn on_message(&self, _destination: &str, message: Arc<Message>) -> AckDecision {
            (self.0)(message).await
        }
    }

    fn make_message(label: &str) -> Arc<Message> {
        Arc::new(Message::event("orders.OrderPlaced", &serde_json::json!({"label": label})).unwrap())
    }

    async fn wait_for(count: &Arc<AtomicUsize>, expected: usize) {
        for _ in 0..200 {
            if count.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {} deliveries, saw {}",
            expected,
            count.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_publish_before_subscribe_is_buffered() {
        let transport = ChannelTransport::new();
        transport
            .publish("orders", make_message("early"))
            .await
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let handle = transport
            .subscribe(
                "orders",
                Arc::new(CountingConsumer {
                    count: Arc::clone(&count),
                    decision: AckDecision::Ack,
                }),
                ConsumerOptions::default(),
            )
            .await
            .unwrap();

        wait_for(&count, 1).await;
        assert!(handle.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_single_consumer_per_destination() {
        let transport = ChannelTransport::new();
        let consumer = Arc::new(CountingConsumer {
            count: Arc::new(AtomicUsize::new(0)),
            decision: AckDecision::Ack,
        });

        let _first = transport
            .subscribe("orders", Arc::clone(&consumer) as _, ConsumerOptions::default())
            .await
            .unwrap();
        let second = transport
            .subscribe("orders", consumer as _, ConsumerOptions::default())
            .await;
        assert!(matches!(second, Err(TransportError::AlreadySubscribed(_))));
    }

    #[tokio::test]
    async fn test_sequential_order_preserved_with_prefetch_one() {
        let transport = ChannelTransport::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));

        let seen_clone = Arc::clone(&seen);
        let count_clone = Arc::clone(&count);
        let consumer = ClosureConsumer(move |message: Arc<Message>| {
            let seen = Arc::clone(&seen_clone);
            let count = Arc::clone(&count_clone);
            Box::pin(async move {
                seen.lock()
                    .await
                    .push(message.payload["label"].as_str().unwrap().to_string());
                count.fetch_add(1, Ordering::SeqCst);
                AckDecision::Ack
            }) as BoxFuture<'static, AckDecision>
        });

        let handle = transport
            .subscribe("orders", Arc::new(consumer), ConsumerOptions::default())
            .await
            .unwrap();

        for label in ["a", "b", "c"] {
            transport.publish("orders", make_message(label)).await.unwrap();
        }

        wait_for(&count, 3).await;
        assert_eq!(*seen.lock().await, vec!["a", "b", "c"]);
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_requeue_redelivers() {
        let transport = ChannelTransport::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        let consumer = ClosureConsumer(move |_message: Arc<Message>| {
            let count = Arc::clone(&count_clone);
            Box::pin(async move {
                // Nack the first delivery, ack the redelivery.
                if count.fetch_add(1, Ordering::SeqCst) == 0 {
                    AckDecision::Requeue
                } else {
                    AckDecision::Ack
                }
            }) as BoxFuture<'static, AckDecision>
        });

        let handle = transport
            .subscribe("orders", Arc::new(consumer), ConsumerOptions::default())
            .await
            .unwrap();
        transport.publish("orders", make_message("retry")).await.unwrap();

        wait_for(&count, 2).await;
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_dead_letter_routes_copy_with_origin() {
        let transport = ChannelTransport::new();
        let count = Arc::new(AtomicUsize::new(0));
        let dead_count = Arc::new(AtomicUsize::new(0));
        let dead_seen: Arc<Mutex<Vec<Arc<Message>>>> = Arc::new(Mutex::new(Vec::new()));

        let handle = transport
            .subscribe(
                "orders",
                Arc::new(CountingConsumer {
                    count: Arc::clone(&count),
                    decision: AckDecision::DeadLetter,
                }),
                ConsumerOptions::default(),
            )
            .await
            .unwrap();

        let dead_seen_clone = Arc::clone(&dead_seen);
        let dead_count_clone = Arc::clone(&dead_count);
        let dead_consumer = ClosureConsumer(move |message: Arc<Message>| {
            let seen = Arc::clone(&dead_seen_clone);
            let count = Arc::clone(&dead_count_clone);
            Box::pin(async move {
                seen.lock().await.push(message);
                count.fetch_add(1, Ordering::SeqCst);
                AckDecision::Ack
            }) as BoxFuture<'static, AckDecision>
        });
        let dead_handle = transport
            .subscribe(DEAD_LETTER_QUEUE, Arc::new(dead_consumer), ConsumerOptions::default())
            .await
            .unwrap();

        transport.publish("orders", make_message("bad")).await.unwrap();

        wait_for(&dead_count, 1).await;
        let dead = dead_seen.lock().await;
        assert_eq!(dead[0].metadata_value(DEAD_LETTER_ORIGIN), Some("orders"));

        handle.stop(Duration::from_secs(1)).await;
        dead_handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let transport = ChannelTransport::new();
        let count = Arc::new(AtomicUsize::new(0));

        let handle = transport
            .subscribe(
                "orders",
                Arc::new(CountingConsumer {
                    count: Arc::clone(&count),
                    decision: AckDecision::Ack,
                }),
                ConsumerOptions::default(),
            )
            .await
            .unwrap();

        handle.pause();
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.publish("orders", make_message("held")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        handle.resume();
        wait_for(&count, 1).await;
        handle.stop(Duration::from_secs(1)).await;
    }
}
