//! HeroMessaging - in-process messaging framework.
//!
//! Dispatches commands, queries, and events through a pluggable decorator
//! pipeline (retry, circuit breaker, rate limiting, idempotency), backed
//! by a transactional outbox and idempotent inbox for at-least-once
//! delivery, a saga engine for long-running coordinated workflows, and a
//! two-strategy message scheduler. Concrete brokers, databases, and codecs
//! plug in behind the `transport`, `storage`, and `serializer` seams; the
//! in-memory implementations shipped here are the reference behavior and
//! the test fixtures.

pub mod config;
pub mod context;
pub mod error;
pub mod inbox;
pub mod message;
pub mod observability;
pub mod outbox;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod saga;
pub mod scheduler;
pub mod security;
pub mod serializer;
pub mod storage;
pub mod transport;
pub mod worker;

pub use context::{CancelToken, CompensationRecorder, ProcessingContext};
pub use error::{ErrorCategory, ProcessingError};
pub use message::{Message, MessageKind};
pub use pipeline::{
    ChainOptions, CommandProcessor, EventDispatcher, MessageProcessor, ProcessingOutcome,
    QueryProcessor,
};
pub use registry::ServiceRegistry;
