//! In-memory timer strategy.
//!
//! One spawned timer task per schedule, sleeping until the delivery time
//! and dispatching through the transport. Cancellation aborts the timer
//! under a Pending check so there is never more than one delivery attempt.
//! All state is lost on restart; durable schedules use the storage-backed
//! strategy instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
    MessageScheduler, Result, ScheduleRequest, ScheduleStatus, ScheduledMessage, SchedulerError,
};
use crate::transport::Transport;

struct TimerEntry {
    entry: ScheduledMessage,
    timer: JoinHandle<()>,
}

/// Timer-based scheduler.
pub struct InMemoryScheduler {
    transport: Arc<dyn Transport>,
    default_destination: String,
    entries: Arc<RwLock<HashMap<Uuid, TimerEntry>>>,
}

impl InMemoryScheduler {
    pub fn new(transport: Arc<dyn Transport>, default_destination: impl Into<String>) -> Self {
        Self {
            transport,
            default_destination: default_destination.into(),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn fire(
        entries: Arc<RwLock<HashMap<Uuid, TimerEntry>>>,
        transport: Arc<dyn Transport>,
        schedule_id: Uuid,
        destination: String,
    ) {
        // Claim: only a Pending entry fires. A racing cancel that got the
        // lock first wins.
        let message = {
            let mut entries = entries.write().await;
            match entries.get_mut(&schedule_id) {
                Some(held) if held.entry.status == ScheduleStatus::Pending => {
                    held.entry.status = ScheduleStatus::Processing;
                    Arc::new(held.entry.message.clone())
                }
                _ => return,
            }
        };

        let outcome = transport.publish(&destination, message).await;

        let mut entries = entries.write().await;
        if let Some(held) = entries.get_mut(&schedule_id) {
            match outcome {
                Ok(()) => {
                    held.entry.status = ScheduleStatus::Delivered;
                    held.entry.delivered_at = Some(Utc::now());
                    debug!(schedule_id = %schedule_id, destination = %destination, "Scheduled message delivered");
                }
                Err(e) => {
                    held.entry.status = ScheduleStatus::Failed;
                    held.entry.last_error = Some(e.to_string());
                    error!(schedule_id = %schedule_id, error = %e, "Scheduled dispatch failed");
                }
            }
        }
    }
}

#[async_trait]
impl MessageScheduler for InMemoryScheduler {
    async fn schedule(&self, request: ScheduleRequest) -> Result<Uuid> {
        let entry = request.into_entry();
        let schedule_id = entry.schedule_id;
        let destination = entry
            .destination
            .clone()
            .unwrap_or_else(|| self.default_destination.clone());

        let delay = (entry.deliver_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let entries = Arc::clone(&self.entries);
        let transport = Arc::clone(&self.transport);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::fire(entries, transport, schedule_id, destination).await;
        });

        info!(
            schedule_id = %schedule_id,
            deliver_at = %entry.deliver_at,
            "Message scheduled (in-memory)"
        );
        self.entries
            .write()
            .await
            .insert(schedule_id, TimerEntry { entry, timer });
        Ok(schedule_id)
    }

    async fn cancel(&self, schedule_id: Uuid) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let held = entries
            .get_mut(&schedule_id)
            .ok_or(SchedulerError::NotFound(schedule_id))?;

        if held.entry.status != ScheduleStatus::Pending {
            return Ok(false);
        }
        held.timer.abort();
        held.entry.status = ScheduleStatus::Cancelled;
        info!(schedule_id = %schedule_id, "Schedule cancelled");
        Ok(true)
    }

    async fn get(&self, schedule_id: Uuid) -> Result<Option<ScheduledMessage>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&schedule_id)
            .map(|held| held.entry.clone()))
    }

    async fn list_pending(&self) -> Result<Vec<ScheduledMessage>> {
        let entries = self.entries.read().await;
        let mut pending: Vec<ScheduledMessage> = entries
            .values()
            .filter(|held| held.entry.status == ScheduleStatus::Pending)
            .map(|held| held.entry.clone())
            .collect();
        pending.sort_by_key(|entry| entry.deliver_at);
        Ok(pending)
    }
}
