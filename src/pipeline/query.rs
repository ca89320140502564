//! Query processor.

use std::sync::Arc;

use tracing::debug;

use super::handlers::{HandlerRegistry, QueryInvoker};
use super::{build_chain, ChainOptions, MessageProcessor};
use crate::context::ProcessingContext;
use crate::error::ProcessingError;
use crate::message::{Message, MessageKind};

/// Dispatches queries through the decorator chain to their single
/// registered handler. Queries always produce a result.
pub struct QueryProcessor {
    chain: Arc<dyn MessageProcessor>,
}

impl QueryProcessor {
    pub fn new(registry: Arc<HandlerRegistry>, options: &ChainOptions) -> Self {
        let invoker: Arc<dyn MessageProcessor> = Arc::new(QueryInvoker::new(registry));
        Self {
            chain: build_chain(invoker, options),
        }
    }

    /// Execute a query with a fresh context.
    pub async fn fetch(&self, message: Message) -> Result<serde_json::Value, ProcessingError> {
        let ctx = ProcessingContext::for_message(&message);
        self.fetch_with(ctx, Arc::new(message)).await
    }

    /// Execute a query under a caller-owned context.
    pub async fn fetch_with(
        &self,
        ctx: ProcessingContext,
        message: Arc<Message>,
    ) -> Result<serde_json::Value, ProcessingError> {
        if message.kind != MessageKind::Query {
            return Err(ProcessingError::Validation(format!(
                "'{}' is a {}, expected a query",
                message.message_type, message.kind
            )));
        }
        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            "Dispatching query"
        );
        let message_type = message.message_type.clone();
        let outcome = self.chain.process(&ctx, message).await?;
        outcome.result.ok_or_else(|| {
            ProcessingError::Fatal(format!(
                "Query handler for '{}' produced no result",
                message_type
            ))
        })
    }
}
