//! Command processor.

use std::sync::Arc;

use tracing::debug;

use super::handlers::{CommandInvoker, HandlerRegistry};
use super::{build_chain, ChainOptions, MessageProcessor};
use crate::context::ProcessingContext;
use crate::error::ProcessingError;
use crate::message::{Message, MessageKind};

/// Dispatches commands through the decorator chain to their single
/// registered handler.
pub struct CommandProcessor {
    chain: Arc<dyn MessageProcessor>,
}

impl CommandProcessor {
    pub fn new(registry: Arc<HandlerRegistry>, options: &ChainOptions) -> Self {
        let invoker: Arc<dyn MessageProcessor> = Arc::new(CommandInvoker::new(registry));
        Self {
            chain: build_chain(invoker, options),
        }
    }

    /// Send a command with a fresh context. Returns the handler's result,
    /// if it produced one.
    pub async fn send(
        &self,
        message: Message,
    ) -> Result<Option<serde_json::Value>, ProcessingError> {
        let ctx = ProcessingContext::for_message(&message);
        self.send_with(ctx, Arc::new(message)).await
    }

    /// Send a command under a caller-owned context (cancellation token,
    /// deadline).
    pub async fn send_with(
        &self,
        ctx: ProcessingContext,
        message: Arc<Message>,
    ) -> Result<Option<serde_json::Value>, ProcessingError> {
        if message.kind != MessageKind::Command {
            return Err(ProcessingError::Validation(format!(
                "'{}' is a {}, expected a command",
                message.message_type, message.kind
            )));
        }
        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            "Dispatching command"
        );
        let outcome = self.chain.process(&ctx, message).await?;
        Ok(outcome.result)
    }
}
