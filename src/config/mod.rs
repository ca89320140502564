//! Application configuration.
//!
//! Aggregates the per-subsystem configuration structs into a single
//! `Config` loadable from YAML files and environment variables. Every
//! struct deserializes with full defaults so a missing file or section
//! still yields a runnable configuration.

use serde::Deserialize;
use tracing::info;

use crate::inbox::InboxConfig;
use crate::outbox::OutboxRelayConfig;
use crate::pipeline::event::{DispatchPolicy, FailurePolicy};
use crate::policy::circuit_breaker::CircuitBreakerConfig;
use crate::policy::idempotency::IdempotencyKeyStrategy;
use crate::policy::rate_limit::RateLimiterConfig;
use crate::policy::retry::RetryConfig;
use crate::saga::SagaConfig;
use crate::scheduler::SchedulerConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for the configuration file path.
pub const CONFIG_ENV_VAR: &str = "HERO_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HERO";
/// Environment variable for the logging filter.
pub const LOG_ENV_VAR: &str = "HERO_LOG";

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration load failed: {0}")]
    Load(#[from] config::ConfigError),
}

/// Processing pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Upper bound on concurrently processed messages per consumer.
    pub max_concurrency: usize,
    /// Per-invocation deadline in milliseconds; 0 disables it.
    pub processing_timeout_ms: u64,
    /// Event handler scheduling.
    pub dispatch: DispatchPolicy,
    /// Event handler failure handling.
    pub failure: FailurePolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            processing_timeout_ms: 30_000,
            dispatch: DispatchPolicy::Sequential,
            failure: FailurePolicy::Aggregate,
        }
    }
}

impl ProcessingConfig {
    pub fn timeout(&self) -> Option<std::time::Duration> {
        if self.processing_timeout_ms == 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(self.processing_timeout_ms))
        }
    }
}

/// Idempotency decorator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub enabled: bool,
    /// How long stored successes replay, in seconds.
    pub ttl_success_secs: u64,
    /// How long stored failures replay, in seconds.
    pub ttl_failure_secs: u64,
    /// Failure caching is opt-in.
    pub cache_failures: bool,
    pub key_strategy: IdempotencyKeyStrategy,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_success_secs: 24 * 60 * 60,
            ttl_failure_secs: 60 * 60,
            cache_failures: false,
            key_strategy: IdempotencyKeyStrategy::MessageId,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub processing: ProcessingConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub idempotency: IdempotencyConfig,
    pub inbox: InboxConfig,
    pub outbox: OutboxRelayConfig,
    pub scheduler: SchedulerConfig,
    pub saga: SagaConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. File named by the `path` argument (required when given)
    /// 3. File named by `HERO_CONFIG` (required when set)
    /// 4. `HERO`-prefixed environment variables (`HERO__OUTBOX__BATCH_SIZE`)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(Environment::with_prefix(CONFIG_ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize::<Self>()?;

        info!("Configuration loaded");
        Ok(config)
    }
}

/// Install the tracing subscriber, filtered by `HERO_LOG` (default
/// "info"). Idempotent: later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
