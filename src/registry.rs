//! Service registry.
//!
//! The saga engine references the scheduler, the scheduler's dispatch path
//! references the transport, and transport consumers may reach back into
//! saga handlers. The registry breaks that cycle: it exclusively owns each
//! component, components hold the registry and look collaborators up by
//! capability on demand instead of holding owning references to each other.
//!
//! Named policy state (circuit breakers, token buckets) is process-wide per
//! configured instance and lives here too, with explicit init and teardown
//! rather than hidden statics.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::policy::circuit_breaker::CircuitBreaker;
use crate::policy::rate_limit::TokenBucket;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No component registered for capability '{0}'")]
    MissingCapability(&'static str),

    #[error("Capability '{0}' already registered")]
    AlreadyRegistered(&'static str),
}

/// Typed capability map plus named policy resources.
#[derive(Default)]
pub struct ServiceRegistry {
    components: std::sync::RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component under its capability type. `T` may be a dyn
    /// trait object (`registry.register::<dyn Transport>(transport)`).
    ///
    /// Fails when the capability is already bound; the registry is the sole
    /// owner of each component.
    pub fn register<T: ?Sized + Send + Sync + 'static>(&self, component: Arc<T>) -> Result<()> {
        let mut components = self
            .components
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match components.entry(TypeId::of::<T>()) {
            std::collections::hash_map::Entry::Occupied(_) => Err(
                RegistryError::AlreadyRegistered(std::any::type_name::<T>()),
            ),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Box::new(component));
                Ok(())
            }
        }
    }

    /// Look up a component by capability type.
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let components = self.components.read().unwrap_or_else(|e| e.into_inner());
        components
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<Arc<T>>())
            .cloned()
    }

    /// Look up a component, failing with a capability error when absent.
    pub fn require<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.get::<T>()
            .ok_or(RegistryError::MissingCapability(std::any::type_name::<T>()))
    }

    /// Get or create the named circuit breaker.
    pub async fn circuit_breaker(
        &self,
        name: &str,
        init: impl FnOnce() -> CircuitBreaker,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write().await;
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(init())),
        )
    }

    /// Get or create the named token bucket.
    pub async fn token_bucket(
        &self,
        name: &str,
        init: impl FnOnce() -> TokenBucket,
    ) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.read().await.get(name) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write().await;
        Arc::clone(
            buckets
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(init())),
        )
    }

    /// Drop all named policy state. Components stay registered.
    pub async fn teardown_policies(&self) {
        let breakers = self.breakers.write().await.drain().count();
        let buckets = self.buckets.write().await.drain().count();
        info!(breakers, buckets, "Policy state torn down");
    }
}
