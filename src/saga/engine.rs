//! Saga engine.
//!
//! Event arrival: resolve the definitions binding the event type, derive
//! the correlation id, load the live instance (or create one for an
//! initial event), run the bound transition, and save under the version
//! guard. A version conflict retries the whole reload-step-save cycle with
//! exponential backoff; exhaustion dead-letters the event. A transition
//! that raises a compensating failure unwinds the instance's compensation
//! log in reverse registration order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::definition::{resolve_target, SagaDefinition, StepContext, StepEffects};
use super::{
    SagaConfig, SagaError, SagaInstance, SagaStepError, COMPENSATION_FAILED_STATE,
};
use crate::context::{CompensationRecord, ProcessingContext};
use crate::error::ProcessingError;
use crate::message::Message;
use crate::pipeline::event::EventDispatcher;
use crate::pipeline::handlers::{EventHandler, HandlerRegistry};
use crate::registry::ServiceRegistry;
use crate::scheduler::{MessageScheduler, ScheduleRequest};
use crate::storage::{
    EnqueueOptions, QueueStore, SagaRepository, StorageError, DEAD_LETTER_ERROR,
    DEAD_LETTER_ORIGIN, DEAD_LETTER_QUEUE,
};

/// Terminal state after a successful compensation run.
pub const FAILED_STATE: &str = "failed";

/// What to do with an event that matches no live instance and is not an
/// initial event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedEventPolicy {
    #[default]
    Ignore,
    DeadLetter,
}

/// State machine runtime over the registered saga definitions.
pub struct SagaEngine {
    definitions: Vec<Arc<SagaDefinition>>,
    repository: Arc<dyn SagaRepository>,
    services: Arc<ServiceRegistry>,
    config: SagaConfig,
}

impl SagaEngine {
    pub fn new(
        repository: Arc<dyn SagaRepository>,
        services: Arc<ServiceRegistry>,
        config: SagaConfig,
    ) -> Self {
        Self {
            definitions: Vec::new(),
            repository,
            services,
            config,
        }
    }

    /// Register a saga definition. Call before wiring the engine into the
    /// event dispatcher.
    pub fn register_definition(&mut self, definition: SagaDefinition) {
        info!(saga = %definition.name(), "Saga definition registered");
        self.definitions.push(Arc::new(definition));
    }

    /// Subscribe the engine to every event type its definitions bind.
    pub fn subscribe_all(engine: &Arc<Self>, handlers: &HandlerRegistry) {
        for definition in &engine.definitions {
            for event_type in definition.event_types() {
                handlers.register_event(
                    event_type,
                    format!("saga:{}", definition.name()),
                    Arc::new(SagaEventHandler {
                        engine: Arc::clone(engine),
                    }) as Arc<dyn EventHandler>,
                );
            }
        }
    }

    /// Feed an event to every definition that binds its type.
    pub async fn handle_event(&self, event: &Message) -> Result<(), SagaError> {
        let mut first_error = None;
        for definition in &self.definitions {
            if !definition.handles_event(&event.message_type) {
                continue;
            }
            if let Err(e) = self.handle_for_definition(definition, event).await {
                error!(
                    saga = %definition.name(),
                    event_type = %event.message_type,
                    error = %e,
                    "Saga step failed"
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn handle_for_definition(
        &self,
        definition: &Arc<SagaDefinition>,
        event: &Message,
    ) -> Result<(), SagaError> {
        let correlation_id = definition
            .correlation_for(event)
            .ok_or_else(|| SagaError::MissingCorrelation(event.message_type.clone()))?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.step_once(definition, event, &correlation_id).await {
                Ok(()) => return Ok(()),
                Err(SagaError::Storage(StorageError::VersionConflict { .. })) => {
                    if attempt > self.config.concurrency_retries {
                        self.dead_letter_event(
                            definition,
                            event,
                            "concurrency retries exhausted",
                        )
                        .await;
                        return Err(SagaError::ConcurrencyExhausted {
                            saga: definition.name().to_string(),
                            correlation_id,
                        });
                    }
                    let backoff = Duration::from_millis(10 * 2u64.pow(attempt.min(6)));
                    warn!(
                        saga = %definition.name(),
                        correlation_id = %correlation_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Version conflict, retrying saga step"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One reload-step-save cycle. A version conflict anywhere inside
    /// bubbles out for the caller to retry.
    async fn step_once(
        &self,
        definition: &Arc<SagaDefinition>,
        event: &Message,
        correlation_id: &str,
    ) -> Result<(), SagaError> {
        let live = self
            .repository
            .find_by_correlation(definition.name(), correlation_id)
            .await?
            .into_iter()
            .find(|instance| !instance.completed);

        let (mut instance, expected_version) = match live {
            Some(instance) => {
                let version = instance.version;
                (instance, version)
            }
            None => {
                if !definition.is_initial_event(&event.message_type) {
                    return self.unmatched(definition, event).await;
                }
                let fresh = SagaInstance::new(definition.name(), correlation_id);
                let version = self.repository.save(fresh.clone(), 0).await?;
                debug!(
                    saga = %definition.name(),
                    instance_id = %fresh.id,
                    correlation_id = %correlation_id,
                    "Saga instance created"
                );
                let mut instance = fresh;
                instance.version = version;
                (instance, version)
            }
        };

        let Some(binding) = definition.binding_for(&instance.state, &event.message_type) else {
            return self.unmatched(definition, event).await;
        };

        if let Some(guard) = &binding.guard {
            if !guard(&instance.data, event) {
                debug!(
                    saga = %definition.name(),
                    instance_id = %instance.id,
                    event_type = %event.message_type,
                    "Guard rejected event"
                );
                return Ok(());
            }
        }

        for mutation in &binding.mutations {
            mutation(&mut instance.data, event);
        }

        let mut publishes: Vec<Message> = Vec::new();
        if let Some(action) = &binding.action {
            let effects = StepEffects::new();
            let step_ctx = StepContext {
                data: instance.data.clone(),
                message: Arc::new(event.clone()),
                effects: effects.clone(),
            };
            match action(step_ctx).await {
                Ok(()) => publishes.extend(effects.take_publishes()),
                Err(SagaStepError::Compensate(reason)) => {
                    return self
                        .run_compensations(definition, instance, expected_version, &reason)
                        .await;
                }
                Err(SagaStepError::Failed(e)) => {
                    self.dead_letter_event(definition, event, &e.to_string()).await;
                    return Err(SagaError::Action(e));
                }
            }
        }

        // The forward work succeeded; its compensation joins the log.
        if let Some(name) = &binding.compensation {
            instance.compensations.push(CompensationRecord {
                name: name.clone(),
                registered_at: Utc::now(),
            });
        }

        for publish in &binding.publishes {
            if let Some(message) = publish(&instance.data, event) {
                publishes.push(message);
            }
        }

        if let Some((state, completed)) = resolve_target(&binding.target, &instance.data, event) {
            debug!(
                saga = %definition.name(),
                instance_id = %instance.id,
                from = %instance.state,
                to = %state,
                completed,
                "Saga transition"
            );
            instance.state = state;
            instance.completed = completed;
        }

        // Any transition supersedes outstanding timeouts.
        let stale_timeouts = std::mem::take(&mut instance.pending_timeouts);

        let mut requested_timeout = None;
        if !instance.completed {
            if let Some((after, make_timeout)) = &binding.timeout {
                if let Some(scheduler) = self.services.get::<dyn MessageScheduler>() {
                    let timeout_event = make_timeout(&instance.data);
                    let timeout_event = if timeout_event.correlation_id.is_some() {
                        timeout_event
                    } else {
                        timeout_event.with_correlation(instance.correlation_id.clone())
                    };
                    let deliver_at = Utc::now()
                        + chrono::Duration::from_std(*after)
                            .unwrap_or_else(|_| chrono::Duration::seconds(0));
                    match scheduler
                        .schedule(ScheduleRequest::new(timeout_event, deliver_at))
                        .await
                    {
                        Ok(schedule_id) => {
                            instance.pending_timeouts.push(schedule_id);
                            requested_timeout = Some(schedule_id);
                        }
                        Err(e) => {
                            warn!(
                                saga = %definition.name(),
                                instance_id = %instance.id,
                                error = %e,
                                "Failed to schedule saga timeout"
                            );
                        }
                    }
                } else {
                    warn!(
                        saga = %definition.name(),
                        "Timeout requested but no scheduler registered"
                    );
                }
            }
        }

        match self.repository.save(instance.clone(), expected_version).await {
            Ok(version) => {
                debug!(
                    saga = %definition.name(),
                    instance_id = %instance.id,
                    version,
                    "Saga instance saved"
                );
            }
            Err(e) => {
                // The step will be retried wholesale; the timeout belongs
                // to this failed attempt.
                if let Some(schedule_id) = requested_timeout {
                    if let Some(scheduler) = self.services.get::<dyn MessageScheduler>() {
                        let _ = scheduler.cancel(schedule_id).await;
                    }
                }
                return Err(e.into());
            }
        }

        self.cancel_timeouts(&stale_timeouts).await;
        self.dispatch_publishes(definition, publishes).await;
        Ok(())
    }

    async fn cancel_timeouts(&self, schedule_ids: &[uuid::Uuid]) {
        if schedule_ids.is_empty() {
            return;
        }
        let Some(scheduler) = self.services.get::<dyn MessageScheduler>() else {
            return;
        };
        for schedule_id in schedule_ids {
            if let Err(e) = scheduler.cancel(*schedule_id).await {
                debug!(schedule_id = %schedule_id, error = %e, "Saga timeout already resolved");
            }
        }
    }

    async fn dispatch_publishes(&self, definition: &Arc<SagaDefinition>, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let Some(dispatcher) = self.services.get::<EventDispatcher>() else {
            warn!(
                saga = %definition.name(),
                dropped = messages.len(),
                "No event dispatcher registered for saga publishes"
            );
            return;
        };
        for message in messages {
            if let Err(e) = dispatcher.publish(message).await {
                error!(saga = %definition.name(), error = %e, "Saga publish failed");
            }
        }
    }

    /// Unwind the compensation log in reverse registration order, then
    /// persist the terminal outcome.
    async fn run_compensations(
        &self,
        definition: &Arc<SagaDefinition>,
        mut instance: SagaInstance,
        expected_version: u64,
        reason: &str,
    ) -> Result<(), SagaError> {
        warn!(
            saga = %definition.name(),
            instance_id = %instance.id,
            compensations = instance.compensations.len(),
            reason = %reason,
            "Compensating saga"
        );

        let timeout = Duration::from_millis(self.config.compensation_timeout_ms.max(1));
        let attempts = self.config.compensation_attempts.max(1);
        let mut failed_compensation = None;

        let records: Vec<CompensationRecord> = instance.compensations.clone();
        for record in records.iter().rev() {
            let Some(compensation) = definition.compensation_fn(&record.name) else {
                error!(
                    saga = %definition.name(),
                    compensation = %record.name,
                    "Compensation has no defined closure"
                );
                failed_compensation = Some(record.name.clone());
                break;
            };

            let mut succeeded = false;
            for attempt in 1..=attempts {
                match tokio::time::timeout(timeout, compensation(instance.data.clone())).await {
                    Ok(Ok(())) => {
                        debug!(
                            saga = %definition.name(),
                            compensation = %record.name,
                            "Compensation succeeded"
                        );
                        succeeded = true;
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(
                            saga = %definition.name(),
                            compensation = %record.name,
                            attempt,
                            error = %e,
                            "Compensation attempt failed"
                        );
                        if !e.is_retryable() {
                            break;
                        }
                    }
                    Err(_) => {
                        warn!(
                            saga = %definition.name(),
                            compensation = %record.name,
                            attempt,
                            timeout_ms = timeout.as_millis() as u64,
                            "Compensation timed out"
                        );
                    }
                }
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(10 * 2u64.pow(attempt.min(6))))
                        .await;
                }
            }

            if !succeeded {
                failed_compensation = Some(record.name.clone());
                break;
            }
        }

        instance.completed = true;
        instance.state = match &failed_compensation {
            Some(name) => {
                error!(
                    saga = %definition.name(),
                    instance_id = %instance.id,
                    compensation = %name,
                    "Compensation failed terminally"
                );
                COMPENSATION_FAILED_STATE.to_string()
            }
            None => FAILED_STATE.to_string(),
        };

        self.force_save_terminal(instance, expected_version).await
    }

    /// Persist a terminal outcome. Compensations already ran, so a version
    /// conflict here is resolved by reapplying the terminal fields on the
    /// latest stored revision rather than re-running anything.
    async fn force_save_terminal(
        &self,
        instance: SagaInstance,
        mut expected_version: u64,
    ) -> Result<(), SagaError> {
        let mut terminal = instance;
        for _ in 0..=self.config.concurrency_retries {
            match self.repository.save(terminal.clone(), expected_version).await {
                Ok(_) => return Ok(()),
                Err(StorageError::VersionConflict { .. }) => {
                    let Some(latest) = self.repository.find_by_id(terminal.id).await? else {
                        return Ok(());
                    };
                    expected_version = latest.version;
                    let mut merged = latest;
                    merged.state = terminal.state.clone();
                    merged.completed = true;
                    merged.compensations = terminal.compensations.clone();
                    terminal = merged;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SagaError::ConcurrencyExhausted {
            saga: terminal.saga_name,
            correlation_id: terminal.correlation_id,
        })
    }

    async fn unmatched(
        &self,
        definition: &Arc<SagaDefinition>,
        event: &Message,
    ) -> Result<(), SagaError> {
        match self.config.unmatched {
            UnmatchedEventPolicy::Ignore => {
                debug!(
                    saga = %definition.name(),
                    event_type = %event.message_type,
                    "Event matches no live instance, ignoring"
                );
                Ok(())
            }
            UnmatchedEventPolicy::DeadLetter => {
                self.dead_letter_event(definition, event, "no live saga instance")
                    .await;
                Ok(())
            }
        }
    }

    async fn dead_letter_event(
        &self,
        definition: &Arc<SagaDefinition>,
        event: &Message,
        reason: &str,
    ) {
        let Some(queues) = self.services.get::<dyn QueueStore>() else {
            warn!(
                saga = %definition.name(),
                event_type = %event.message_type,
                reason = %reason,
                "Dead-letter requested but no queue store registered"
            );
            return;
        };

        let copy = event
            .clone()
            .with_metadata(DEAD_LETTER_ORIGIN, format!("saga:{}", definition.name()))
            .with_metadata(DEAD_LETTER_ERROR, reason);
        if let Err(e) = queues
            .enqueue(DEAD_LETTER_QUEUE, copy, EnqueueOptions::default())
            .await
        {
            error!(saga = %definition.name(), error = %e, "Failed to dead-letter saga event");
        }
    }
}

impl From<SagaError> for ProcessingError {
    fn from(error: SagaError) -> Self {
        match error {
            SagaError::Action(e) => e,
            SagaError::ConcurrencyExhausted { saga, correlation_id } => ProcessingError::Conflict(
                format!("saga '{}' correlation '{}'", saga, correlation_id),
            ),
            SagaError::Storage(e) => ProcessingError::Transient(e.to_string()),
            SagaError::MissingCorrelation(event) => ProcessingError::Validation(format!(
                "event '{}' carries no correlation id",
                event
            )),
            SagaError::UnboundEvent { saga, event, state } => ProcessingError::NotFound(format!(
                "saga '{}' has no transition for '{}' in '{}'",
                saga, event, state
            )),
            SagaError::Completed { saga, id } => {
                ProcessingError::NotFound(format!("saga '{}' instance {} is completed", saga, id))
            }
            SagaError::CompensationFailed { name, error } => {
                ProcessingError::Fatal(format!("compensation '{}' failed: {}", name, error))
            }
        }
    }
}

/// Event-bus adapter: lets the engine subscribe like any other handler.
pub struct SagaEventHandler {
    engine: Arc<SagaEngine>,
}

#[async_trait]
impl EventHandler for SagaEventHandler {
    async fn handle(
        &self,
        _ctx: &ProcessingContext,
        message: &Message,
    ) -> Result<(), ProcessingError> {
        self.engine.handle_event(message).await.map_err(Into::into)
    }
}
