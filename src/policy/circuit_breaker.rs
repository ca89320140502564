//! Circuit breaker.
//!
//! State transitions, tracked independently per error category:
//! - Closed → Open: consecutive failures inside the sliding window reach
//!   the threshold
//! - Open → HalfOpen: after the cool-down, the next admission check
//!   releases a bounded probe budget
//! - HalfOpen → Closed: a probe succeeds
//! - HalfOpen → Open: a probe fails
//!
//! The transition function is pure over (prior state, observation, clock);
//! every mutation takes an explicit instant so tests drive the clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{ErrorCategory, ProcessingError};
use crate::policy::retry::RetryPolicy;

/// Breaker state for one error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing fast, calls rejected until the cool-down elapses.
    Open,
    /// Cool-down elapsed, a bounded number of probes is admitted.
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within the window that trip the circuit.
    pub failure_threshold: u32,
    /// Sliding window for counting failures, in milliseconds.
    pub window_ms: u64,
    /// Cool-down before probes are admitted, in milliseconds.
    pub open_ms: u64,
    /// Probes admitted in HalfOpen before the outcome decides the state.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            open_ms: 30_000,
            half_open_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_ms)
    }
}

#[derive(Debug)]
struct CategoryState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probes_remaining: u32,
}

impl CategoryState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probes_remaining: 0,
        }
    }
}

/// Per-error-category circuit breaker.
///
/// Shared process-wide per configured instance; owned by the service
/// registry under a name.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    categories: Mutex<HashMap<ErrorCategory, CategoryState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            categories: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check: may a call proceed right now?
    ///
    /// Transitions any cooled-down Open category to HalfOpen and charges a
    /// probe from its budget.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Admission check against an explicit clock.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut categories = self.categories.lock().unwrap_or_else(|e| e.into_inner());

        for (category, entry) in categories.iter_mut() {
            match entry.state {
                CircuitState::Closed => {}
                CircuitState::Open => {
                    let cooled = entry
                        .opened_at
                        .map(|at| now.duration_since(at) >= self.config.open_duration())
                        .unwrap_or(true);
                    if cooled {
                        info!(category = %category.as_str(), "Circuit breaker: Open -> HalfOpen");
                        entry.state = CircuitState::HalfOpen;
                        entry.probes_remaining = self.config.half_open_probes;
                    } else {
                        return false;
                    }
                }
                CircuitState::HalfOpen => {}
            }
            if entry.state == CircuitState::HalfOpen {
                if entry.probes_remaining == 0 {
                    return false;
                }
                entry.probes_remaining -= 1;
            }
        }

        true
    }

    /// Record a successful call: closes every half-open category and clears
    /// its failure window.
    pub fn record_success(&self) {
        let mut categories = self.categories.lock().unwrap_or_else(|e| e.into_inner());
        for (category, entry) in categories.iter_mut() {
            if entry.state == CircuitState::HalfOpen {
                info!(category = %category.as_str(), "Circuit breaker: HalfOpen -> Closed");
            }
            entry.state = CircuitState::Closed;
            entry.failures.clear();
            entry.opened_at = None;
            entry.probes_remaining = 0;
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, category: ErrorCategory) {
        self.record_failure_at(category, Instant::now());
    }

    /// Record a failed call against an explicit clock.
    pub fn record_failure_at(&self, category: ErrorCategory, now: Instant) {
        let mut categories = self.categories.lock().unwrap_or_else(|e| e.into_inner());
        let entry = categories.entry(category).or_insert_with(CategoryState::new);

        match entry.state {
            CircuitState::Closed => {
                entry.failures.push_back(now);
                let window = self.config.window();
                while let Some(&oldest) = entry.failures.front() {
                    if now.duration_since(oldest) > window {
                        entry.failures.pop_front();
                    } else {
                        break;
                    }
                }

                if entry.failures.len() as u32 >= self.config.failure_threshold {
                    warn!(
                        category = %category.as_str(),
                        failures = entry.failures.len(),
                        "Circuit breaker: Closed -> Open"
                    );
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(category = %category.as_str(), "Circuit breaker: HalfOpen -> Open (probe failed)");
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
                entry.probes_remaining = 0;
                entry.failures.clear();
            }
            CircuitState::Open => {}
        }
    }

    /// Current state for a category.
    pub fn state(&self, category: ErrorCategory) -> CircuitState {
        self.categories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&category)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Whether any category is currently rejecting calls.
    pub fn is_open_at(&self, now: Instant) -> bool {
        let categories = self.categories.lock().unwrap_or_else(|e| e.into_inner());
        categories.values().any(|entry| {
            entry.state == CircuitState::Open
                && entry
                    .opened_at
                    .map(|at| now.duration_since(at) < self.config.open_duration())
                    .unwrap_or(false)
        })
    }
}

/// Retry policy wrapper that refuses retries while the circuit is open.
pub struct CircuitBreakerPolicy {
    inner: std::sync::Arc<dyn RetryPolicy>,
    breaker: std::sync::Arc<CircuitBreaker>,
}

impl CircuitBreakerPolicy {
    pub fn new(
        inner: std::sync::Arc<dyn RetryPolicy>,
        breaker: std::sync::Arc<CircuitBreaker>,
    ) -> Self {
        Self { inner, breaker }
    }
}

impl RetryPolicy for CircuitBreakerPolicy {
    fn should_retry(&self, error: &ProcessingError, attempt: u32) -> bool {
        if self.breaker.is_open_at(Instant::now()) {
            return false;
        }
        self.inner.should_retry(error, attempt)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.inner.delay_for(attempt)
    }
}
