//! Event dispatcher.
//!
//! Resolves every handler registered for an event type and runs each
//! inside its own decorator chain instance. Sequential dispatch preserves
//! registration order; parallel dispatch runs handlers concurrently with
//! no ordering between them.

use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, error};

use super::handlers::{EventHandlerInvoker, HandlerRegistry};
use super::{build_chain, ChainOptions, MessageProcessor};
use crate::context::ProcessingContext;
use crate::error::ProcessingError;
use crate::message::{Message, MessageKind};

/// How handlers for one event run relative to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPolicy {
    #[default]
    Sequential,
    Parallel,
}

/// What a handler failure does to the rest of the dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop at the first failure and surface it.
    FailFast,
    /// Run everything; the report carries per-handler results.
    #[default]
    Aggregate,
}

/// Per-handler results of one event dispatch.
#[derive(Debug, Default)]
pub struct EventDispatchReport {
    pub results: Vec<(String, Result<(), ProcessingError>)>,
}

impl EventDispatchReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn first_error(&self) -> Option<&ProcessingError> {
        self.results
            .iter()
            .find_map(|(_, result)| result.as_ref().err())
    }
}

/// Fan-out dispatcher for events.
pub struct EventDispatcher {
    registry: Arc<HandlerRegistry>,
    options: ChainOptions,
    dispatch: DispatchPolicy,
    failure: FailurePolicy,
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        options: ChainOptions,
        dispatch: DispatchPolicy,
        failure: FailurePolicy,
    ) -> Self {
        Self {
            registry,
            options,
            dispatch,
            failure,
        }
    }

    fn chain_for(&self, name: &str, handler: Arc<dyn super::handlers::EventHandler>) -> Arc<dyn MessageProcessor> {
        let invoker: Arc<dyn MessageProcessor> =
            Arc::new(EventHandlerInvoker::new(name, handler));
        build_chain(invoker, &self.options)
    }

    /// Publish an event to every registered handler.
    ///
    /// With `FailFast` the first failure is returned as an error; with
    /// `Aggregate` the report always comes back and carries per-handler
    /// results. An event with no handlers dispatches to nothing.
    pub async fn publish(&self, event: Message) -> Result<EventDispatchReport, ProcessingError> {
        if event.kind != MessageKind::Event {
            return Err(ProcessingError::Validation(format!(
                "'{}' is a {}, expected an event",
                event.message_type, event.kind
            )));
        }

        let handlers = self.registry.event_handlers(&event.message_type);
        if handlers.is_empty() {
            debug!(message_type = %event.message_type, "Event has no handlers");
            return Ok(EventDispatchReport::default());
        }

        let message = Arc::new(event);
        let mut report = EventDispatchReport::default();

        match self.dispatch {
            DispatchPolicy::Sequential => {
                for (name, handler) in handlers {
                    let chain = self.chain_for(&name, handler);
                    let ctx = ProcessingContext::for_message(&message);
                    let result = chain
                        .process(&ctx, Arc::clone(&message))
                        .await
                        .map(|_| ());

                    if let Err(e) = &result {
                        error!(handler = %name, error = %e, "Event handler failed");
                        if self.failure == FailurePolicy::FailFast {
                            return Err(e.clone());
                        }
                    }
                    report.results.push((name, result));
                }
            }
            DispatchPolicy::Parallel => {
                let dispatches = handlers.into_iter().map(|(name, handler)| {
                    let chain = self.chain_for(&name, handler);
                    let message = Arc::clone(&message);
                    async move {
                        let ctx = ProcessingContext::for_message(&message);
                        let result = chain.process(&ctx, message).await.map(|_| ());
                        (name, result)
                    }
                });

                for (name, result) in join_all(dispatches).await {
                    if let Err(e) = &result {
                        error!(handler = %name, error = %e, "Event handler failed");
                    }
                    report.results.push((name, result));
                }

                if self.failure == FailurePolicy::FailFast {
                    if let Some(error) = report.first_error() {
                        return Err(error.clone());
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handlers::EventHandler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        count: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(
            &self,
            _ctx: &ProcessingContext,
            _message: &Message,
        ) -> Result<(), ProcessingError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProcessingError::Transient("handler failed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn make_event() -> Message {
        Message::event("orders.OrderPlaced", &serde_json::json!({"order_id": "O1"})).unwrap()
    }

    fn register(registry: &HandlerRegistry, name: &str, count: &Arc<AtomicUsize>, fail: bool) {
        registry.register_event(
            "orders.OrderPlaced",
            name,
            Arc::new(CountingHandler {
                count: Arc::clone(count),
                fail,
            }),
        );
    }

    #[tokio::test]
    async fn test_sequential_dispatch_reaches_all_handlers() {
        let registry = Arc::new(HandlerRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        register(&registry, "audit", &count, false);
        register(&registry, "billing", &count, false);

        let dispatcher = EventDispatcher::new(
            registry,
            ChainOptions::default(),
            DispatchPolicy::Sequential,
            FailurePolicy::Aggregate,
        );

        let report = dispatcher.publish(make_event()).await.unwrap();
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_sequential_dispatch() {
        let registry = Arc::new(HandlerRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        register(&registry, "first", &count, true);
        register(&registry, "second", &count, false);

        let dispatcher = EventDispatcher::new(
            registry,
            ChainOptions::default(),
            DispatchPolicy::Sequential,
            FailurePolicy::FailFast,
        );

        let err = dispatcher.publish(make_event()).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Transient(_)));
        // The second handler never ran.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_aggregate_continues_past_failures() {
        let registry = Arc::new(HandlerRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        register(&registry, "first", &count, true);
        register(&registry, "second", &count, false);

        let dispatcher = EventDispatcher::new(
            registry,
            ChainOptions::default(),
            DispatchPolicy::Sequential,
            FailurePolicy::Aggregate,
        );

        let report = dispatcher.publish(make_event()).await.unwrap();
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(report.results[0].0, "first");
        assert!(report.results[0].1.is_err());
    }

    #[tokio::test]
    async fn test_parallel_dispatch_runs_every_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c", "d"] {
            register(&registry, name, &count, false);
        }

        let dispatcher = EventDispatcher::new(
            registry,
            ChainOptions::default(),
            DispatchPolicy::Parallel,
            FailurePolicy::Aggregate,
        );

        let report = dispatcher.publish(make_event()).await.unwrap();
        assert_eq!(report.succeeded(), 4);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_event_without_handlers_is_a_no_op() {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = EventDispatcher::new(
            registry,
            ChainOptions::default(),
            DispatchPolicy::Sequential,
            FailurePolicy::Aggregate,
        );

        let report = dispatcher.publish(make_event()).await.unwrap();
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_non_event_rejected() {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = EventDispatcher::new(
            registry,
            ChainOptions::default(),
            DispatchPolicy::Sequential,
            FailurePolicy::Aggregate,
        );

        let command = Message::command("orders.PlaceOrder", &serde_json::json!({})).unwrap();
        let err = dispatcher.publish(command).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Validation(_)));
    }
}
