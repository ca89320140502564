//! Storage-backed polling strategy.
//!
//! Every schedule is persisted; a background worker polls the store for
//! due entries, claims each with a compare-and-swap, dispatches through
//! the transport, and records the outcome. Delivery drift is bounded by
//! the poll interval plus dispatch latency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::interval;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
    MessageScheduler, Result, ScheduleRequest, ScheduledMessage, SchedulerConfig, SchedulerError,
};
use crate::storage::ScheduledMessageStore;
use crate::transport::Transport;
use crate::worker::WorkerHandle;

/// Store-polling scheduler.
pub struct PollingScheduler {
    store: Arc<dyn ScheduledMessageStore>,
    transport: Arc<dyn Transport>,
    config: SchedulerConfig,
}

impl PollingScheduler {
    pub fn new(
        store: Arc<dyn ScheduledMessageStore>,
        transport: Arc<dyn Transport>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// One poll cycle: claim and dispatch everything due. Returns how many
    /// entries were delivered.
    pub async fn poll_once(&self) -> Result<usize> {
        let due = self
            .store
            .get_due(Utc::now(), self.config.batch_size)
            .await?;
        let mut delivered = 0;

        for entry in due {
            // Claim; a cancel or another worker may have got there first.
            if !self.store.mark_processing(entry.schedule_id).await? {
                continue;
            }

            let destination = entry
                .destination
                .clone()
                .unwrap_or_else(|| self.config.default_destination.clone());
            let message = Arc::new(entry.message.clone());

            match self.transport.publish(&destination, message).await {
                Ok(()) => {
                    self.store.mark_delivered(entry.schedule_id).await?;
                    delivered += 1;
                    debug!(
                        schedule_id = %entry.schedule_id,
                        destination = %destination,
                        "Scheduled message delivered"
                    );
                }
                Err(e) => {
                    self.store
                        .mark_failed(entry.schedule_id, &e.to_string())
                        .await?;
                    error!(
                        schedule_id = %entry.schedule_id,
                        error = %e,
                        "Scheduled dispatch failed"
                    );
                }
            }
        }

        Ok(delivered)
    }

    /// Spawn the polling loop.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let scheduler = self;
        let cadence = Duration::from_millis(scheduler.config.poll_interval_ms.max(1));

        WorkerHandle::spawn("polling-scheduler", move |mut stop| async move {
            let mut ticker = interval(cadence);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match scheduler.poll_once().await {
                            Ok(0) => {}
                            Ok(delivered) => {
                                info!(delivered, "Scheduler delivered due messages");
                            }
                            Err(e) => error!(error = %e, "Scheduler poll failed"),
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

#[async_trait]
impl MessageScheduler for PollingScheduler {
    async fn schedule(&self, request: ScheduleRequest) -> Result<Uuid> {
        let entry = request.into_entry();
        let schedule_id = entry.schedule_id;
        info!(
            schedule_id = %schedule_id,
            deliver_at = %entry.deliver_at,
            "Message scheduled (storage-backed)"
        );
        self.store.add(entry).await?;
        Ok(schedule_id)
    }

    async fn cancel(&self, schedule_id: Uuid) -> Result<bool> {
        match self.store.cancel(schedule_id).await {
            Ok(cancelled) => Ok(cancelled),
            Err(crate::storage::StorageError::NotFound(_)) => {
                Err(SchedulerError::NotFound(schedule_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, schedule_id: Uuid) -> Result<Option<ScheduledMessage>> {
        Ok(self.store.get(schedule_id).await?)
    }

    async fn list_pending(&self) -> Result<Vec<ScheduledMessage>> {
        Ok(self.store.list_pending().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::scheduler::ScheduleStatus;
    use crate::storage::memory::InMemoryScheduledMessageStore;
    use crate::transport::ChannelTransport;

    fn make_scheduler(
        poll_interval_ms: u64,
    ) -> (Arc<PollingScheduler>, Arc<InMemoryScheduledMessageStore>) {
        let store = Arc::new(InMemoryScheduledMessageStore::new());
        let scheduler = Arc::new(PollingScheduler::new(
            Arc::clone(&store) as _,
            Arc::new(ChannelTransport::new()),
            SchedulerConfig {
                poll_interval_ms,
                ..Default::default()
            },
        ));
        (scheduler, store)
    }

    fn make_request(offset: chrono::Duration) -> ScheduleRequest {
        let message = Message::event("timers.Fired", &serde_json::json!({})).unwrap();
        ScheduleRequest::new(message, Utc::now() + offset)
    }

    #[tokio::test]
    async fn test_poll_delivers_due_entries_only() {
        let (scheduler, _store) = make_scheduler(1_000);

        let due = scheduler
            .schedule(make_request(chrono::Duration::milliseconds(-10)))
            .await
            .unwrap();
        let future = scheduler
            .schedule(make_request(chrono::Duration::seconds(60)))
            .await
            .unwrap();

        assert_eq!(scheduler.poll_once().await.unwrap(), 1);

        let delivered = scheduler.get(due).await.unwrap().unwrap();
        assert_eq!(delivered.status, ScheduleStatus::Delivered);
        let pending = scheduler.get(future).await.unwrap().unwrap();
        assert_eq!(pending.status, ScheduleStatus::Pending);
        assert_eq!(scheduler.list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_blocks_later_poll() {
        let (scheduler, _store) = make_scheduler(1_000);

        let id = scheduler
            .schedule(make_request(chrono::Duration::milliseconds(-10)))
            .await
            .unwrap();
        assert!(scheduler.cancel(id).await.unwrap());

        assert_eq!(scheduler.poll_once().await.unwrap(), 0);
        let entry = scheduler.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, ScheduleStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_claimed_entry_not_redelivered() {
        let (scheduler, store) = make_scheduler(1_000);

        let id = scheduler
            .schedule(make_request(chrono::Duration::milliseconds(-10)))
            .await
            .unwrap();

        // Another worker already claimed it.
        assert!(store.mark_processing(id).await.unwrap());
        assert_eq!(scheduler.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_worker_delivers_within_poll_bound() {
        let (scheduler, _store) = make_scheduler(10);
        let handle = Arc::clone(&scheduler).spawn();

        let id = scheduler
            .schedule(make_request(chrono::Duration::milliseconds(-1)))
            .await
            .unwrap();

        let mut delivered = false;
        for _ in 0..100 {
            if scheduler.get(id).await.unwrap().unwrap().status == ScheduleStatus::Delivered {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(delivered, "entry should deliver within the poll interval");
        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }
}
