//! Handler traits, registry, and the innermost invoker processors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{MessageProcessor, ProcessingOutcome};
use crate::context::ProcessingContext;
use crate::error::ProcessingError;
use crate::message::{Message, MessageKind};

/// Handles a single command type. May produce a result.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &ProcessingContext,
        message: &Message,
    ) -> Result<Option<serde_json::Value>, ProcessingError>;
}

/// Handles a single query type. Always produces a result.
///
/// Query handlers must be side-effect-free by contract. The runtime cannot
/// enforce this; it is a documented invariant of the registration.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &ProcessingContext,
        message: &Message,
    ) -> Result<serde_json::Value, ProcessingError>;
}

/// Handles an event type. Events produce no result; any number of handlers
/// may subscribe to the same type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &ProcessingContext,
        message: &Message,
    ) -> Result<(), ProcessingError>;
}

/// Handler registration keyed by message type.
///
/// Commands and queries resolve to exactly one handler; registering a
/// second for the same type is a programmer error. Events fan out to every
/// registered handler.
#[derive(Default)]
pub struct HandlerRegistry {
    commands: std::sync::RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    queries: std::sync::RwLock<HashMap<String, Arc<dyn QueryHandler>>>,
    events: std::sync::RwLock<HashMap<String, Vec<(String, Arc<dyn EventHandler>)>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), ProcessingError> {
        let message_type = message_type.into();
        let mut commands = self.commands.write().unwrap_or_else(|e| e.into_inner());
        if commands.contains_key(&message_type) {
            return Err(ProcessingError::Fatal(format!(
                "Command handler for '{}' registered twice",
                message_type
            )));
        }
        info!(message_type = %message_type, "Command handler registered");
        commands.insert(message_type, handler);
        Ok(())
    }

    pub fn register_query(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<(), ProcessingError> {
        let message_type = message_type.into();
        let mut queries = self.queries.write().unwrap_or_else(|e| e.into_inner());
        if queries.contains_key(&message_type) {
            return Err(ProcessingError::Fatal(format!(
                "Query handler for '{}' registered twice",
                message_type
            )));
        }
        info!(message_type = %message_type, "Query handler registered");
        queries.insert(message_type, handler);
        Ok(())
    }

    pub fn register_event(
        &self,
        message_type: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        let message_type = message_type.into();
        let name = name.into();
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        info!(message_type = %message_type, handler = %name, "Event handler registered");
        events
            .entry(message_type)
            .or_default()
            .push((name, handler));
    }

    pub fn command_handler(&self, message_type: &str) -> Option<Arc<dyn CommandHandler>> {
        self.commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_type)
            .cloned()
    }

    pub fn query_handler(&self, message_type: &str) -> Option<Arc<dyn QueryHandler>> {
        self.queries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_type)
            .cloned()
    }

    /// All event handlers for a type, in registration order.
    pub fn event_handlers(&self, message_type: &str) -> Vec<(String, Arc<dyn EventHandler>)> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }
}

// ============================================================================
// Invokers
// ============================================================================

/// Innermost processor resolving and invoking the single command handler.
pub struct CommandInvoker {
    registry: Arc<HandlerRegistry>,
}

impl CommandInvoker {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageProcessor for CommandInvoker {
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        if message.kind != MessageKind::Command {
            return Err(ProcessingError::Validation(format!(
                "'{}' is a {}, not a command",
                message.message_type, message.kind
            )));
        }
        let handler = self
            .registry
            .command_handler(&message.message_type)
            .ok_or_else(|| ProcessingError::HandlerNotFound(message.message_type.clone()))?;

        let result = handler.handle(ctx, &message).await?;
        Ok(ProcessingOutcome { result })
    }
}

/// Innermost processor resolving and invoking the single query handler.
pub struct QueryInvoker {
    registry: Arc<HandlerRegistry>,
}

impl QueryInvoker {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageProcessor for QueryInvoker {
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        if message.kind != MessageKind::Query {
            return Err(ProcessingError::Validation(format!(
                "'{}' is a {}, not a query",
                message.message_type, message.kind
            )));
        }
        let handler = self
            .registry
            .query_handler(&message.message_type)
            .ok_or_else(|| ProcessingError::HandlerNotFound(message.message_type.clone()))?;

        let result = handler.handle(ctx, &message).await?;
        Ok(ProcessingOutcome::with_result(result))
    }
}

/// Innermost processor invoking one event handler. The event dispatcher
/// wraps one of these per handler so each runs inside its own chain.
pub struct EventHandlerInvoker {
    name: String,
    handler: Arc<dyn EventHandler>,
}

impl EventHandlerInvoker {
    pub fn new(name: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl MessageProcessor for EventHandlerInvoker {
    async fn process(
        &self,
        ctx: &ProcessingContext,
        message: Arc<Message>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        self.handler.handle(ctx, &message).await?;
        Ok(ProcessingOutcome::empty())
    }
}
