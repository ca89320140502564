//! Idempotent inbox.
//!
//! Inbound durable path: on receipt the filter computes a deduplication
//! key, checks the inbox store for a prior non-duplicate entry inside the
//! deduplication window, and either drops the message (recording the
//! duplicate) or records a Pending entry, invokes the handler, and marks
//! the outcome. Failed entries stay queryable for replay; a periodic
//! cleanup removes old Processed entries while Failed entries are retained
//! until explicitly purged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ProcessingError;
use crate::message::Message;
use crate::storage::{InboxStore, StorageError};
use crate::worker::WorkerHandle;

/// Metadata key overriding the default (message id) deduplication key.
pub const DEDUP_KEY_METADATA: &str = "dedup-key";

/// Lifecycle of an inbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxStatus {
    /// Accepted, handler not finished yet.
    Pending,
    /// Handler succeeded.
    Processed,
    /// Handler failed; retained for replay until purged.
    Failed,
    /// Dropped as a repeat inside the deduplication window.
    Duplicate,
}

/// Record of one received message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub id: Uuid,
    pub message_id: Uuid,
    /// Logical source (queue, topic, in-process route).
    pub source: String,
    pub dedup_key: String,
    pub status: InboxStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl InboxEntry {
    pub fn new(message: &Message, source: impl Into<String>, dedup_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: message.id,
            source: source.into(),
            dedup_key: dedup_key.into(),
            status: InboxStatus::Pending,
            received_at: Utc::now(),
            processed_at: None,
            error: None,
        }
    }
}

/// Inbox configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Window inside which a repeated key is a duplicate, in seconds.
    pub deduplication_window_secs: u64,
    /// Age after which Processed entries are removed, in seconds.
    pub retention_processed_secs: u64,
    /// Age below which Failed entries survive an explicit purge, in
    /// seconds. The periodic cleanup never touches Failed entries.
    pub retention_failed_secs: u64,
    /// Cleanup cadence, in seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            deduplication_window_secs: 24 * 60 * 60,
            retention_processed_secs: 7 * 24 * 60 * 60,
            retention_failed_secs: 30 * 24 * 60 * 60,
            cleanup_interval_secs: 60 * 60,
        }
    }
}

impl InboxConfig {
    pub fn deduplication_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.deduplication_window_secs as i64)
    }
}

/// Outcome of offering a message to the inbox.
#[derive(Debug)]
pub enum InboxOutcome {
    /// Handler ran and succeeded.
    Processed,
    /// Dropped as a duplicate; the handler did not run.
    Duplicate,
    /// Handler ran and failed; the entry is retained for replay.
    Failed(ProcessingError),
}

/// Duplicate-detection filter in front of a handler.
pub struct InboxFilter {
    store: Arc<dyn InboxStore>,
    config: InboxConfig,
}

impl InboxFilter {
    pub fn new(store: Arc<dyn InboxStore>, config: InboxConfig) -> Self {
        Self { store, config }
    }

    fn dedup_key(message: &Message) -> String {
        message
            .metadata_value(DEDUP_KEY_METADATA)
            .map(str::to_string)
            .unwrap_or_else(|| message.id.to_string())
    }

    /// Offer a message: deduplicate, then run `handler` exactly once per
    /// key inside the window.
    pub async fn accept<F, Fut>(
        &self,
        source: &str,
        message: &Message,
        handler: F,
    ) -> Result<InboxOutcome, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), ProcessingError>>,
    {
        let dedup_key = Self::dedup_key(message);
        let window = self.config.deduplication_window();

        if self.store.is_duplicate(&dedup_key, window).await? {
            debug!(
                message_id = %message.id,
                dedup_key = %dedup_key,
                "Duplicate message dropped"
            );
            let mut duplicate = InboxEntry::new(message, source, dedup_key.as_str());
            duplicate.status = InboxStatus::Duplicate;
            self.store.add(duplicate).await?;
            return Ok(InboxOutcome::Duplicate);
        }

        let entry = InboxEntry::new(message, source, dedup_key.as_str());
        let entry_id = entry.id;
        self.store.add(entry).await?;

        match handler().await {
            Ok(()) => {
                self.store.mark_processed(entry_id).await?;
                debug!(message_id = %message.id, "Inbox entry processed");
                Ok(InboxOutcome::Processed)
            }
            Err(e) => {
                self.store.mark_failed(entry_id, &e.to_string()).await?;
                warn!(message_id = %message.id, error = %e, "Inbox handler failed");
                Ok(InboxOutcome::Failed(e))
            }
        }
    }

    /// Re-run the handler for a Failed entry.
    pub async fn retry<F, Fut>(
        &self,
        entry_id: Uuid,
        handler: F,
    ) -> Result<InboxOutcome, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), ProcessingError>>,
    {
        let entry = self
            .store
            .get(entry_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("inbox entry {}", entry_id)))?;
        if entry.status != InboxStatus::Failed {
            return Err(StorageError::InvalidState(format!(
                "inbox entry {} is not failed",
                entry_id
            )));
        }

        match handler().await {
            Ok(()) => {
                self.store.mark_processed(entry_id).await?;
                Ok(InboxOutcome::Processed)
            }
            Err(e) => {
                self.store.mark_failed(entry_id, &e.to_string()).await?;
                Ok(InboxOutcome::Failed(e))
            }
        }
    }

    /// Entries whose handler has not succeeded, oldest first.
    pub async fn unprocessed(&self, limit: usize) -> Result<Vec<InboxEntry>, StorageError> {
        self.store.unprocessed(limit).await
    }

    /// Explicitly purge Failed entries older than the failed-retention
    /// period. Never runs automatically.
    pub async fn purge_failed(&self) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.retention_failed_secs as i64);
        let removed = self.store.purge_failed_before(cutoff).await?;
        if removed > 0 {
            info!(removed, "Purged failed inbox entries");
        }
        Ok(removed)
    }

    /// Spawn the periodic cleanup worker. Processed entries older than the
    /// retention period are deleted; Failed entries are never touched here.
    pub fn spawn_cleanup(self: &Arc<Self>) -> WorkerHandle {
        let filter = Arc::clone(self);
        let cadence = Duration::from_secs(self.config.cleanup_interval_secs.max(1));

        WorkerHandle::spawn("inbox-cleanup", move |mut stop| async move {
            let mut ticker = interval(cadence);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = Utc::now()
                            - chrono::Duration::seconds(
                                filter.config.retention_processed_secs as i64,
                            );
                        match filter.store.cleanup_processed_before(cutoff).await {
                            Ok(0) => {}
                            Ok(removed) => {
                                info!(removed, "Inbox cleanup removed processed entries");
                            }
                            Err(e) => error!(error = %e, "Inbox cleanup failed"),
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
