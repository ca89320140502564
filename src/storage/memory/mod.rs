//! In-memory reference store implementations.
//!
//! One implementation per store trait, state behind `tokio::sync::RwLock`.
//! These are the canonical reference for store behavior (eligibility
//! ordering, CAS claims, dedup windows, TTL-at-read) and the fixtures the
//! test suite runs against. They lose all state on restart.

mod idempotency;
mod inbox;
mod message;
mod outbox;
mod queue;
mod saga;
mod scheduled;

pub use idempotency::InMemoryIdempotencyStore;
pub use inbox::InMemoryInboxStore;
pub use message::InMemoryMessageStore;
pub use outbox::InMemoryOutboxStore;
pub use queue::InMemoryQueueStore;
pub use saga::InMemorySagaRepository;
pub use scheduled::InMemoryScheduledMessageStore;
