//! Background worker lifecycle.
//!
//! Polling workers (outbox relay, inbox cleanup, storage-backed scheduler,
//! transport pumps) share one shutdown discipline: signal stop through a
//! watch channel, then join within a bounded drain timeout. After the drain
//! window, pending work is left in the store to recover on next start.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle to a running background worker.
pub struct WorkerHandle {
    name: &'static str,
    stop: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a worker loop. The loop body receives the stop receiver and is
    /// expected to exit promptly once it observes the signal.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let join = tokio::spawn(body(stop_rx));
        info!(worker = name, "Worker started");
        Self {
            name,
            stop,
            join: Some(join),
        }
    }

    /// Signal the worker to stop without waiting.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Two-phase shutdown: signal stop, then join within `drain`.
    ///
    /// Returns true when the worker exited inside the drain window. On
    /// timeout the task is aborted; in-store state recovers on next start.
    pub async fn shutdown(mut self, drain: Duration) -> bool {
        self.stop();
        let Some(mut join) = self.join.take() else {
            return true;
        };

        match tokio::time::timeout(drain, &mut join).await {
            Ok(_) => {
                info!(worker = self.name, "Worker stopped");
                true
            }
            Err(_) => {
                warn!(
                    worker = self.name,
                    drain_ms = drain.as_millis() as u64,
                    "Worker did not drain in time, aborting"
                );
                join.abort();
                false
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}
