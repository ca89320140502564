//! Processing errors.
//!
//! Failures are a closed sum of categories rather than an open type
//! hierarchy. Decorators, the outbox relay, and the saga engine branch on
//! the category, not on the concrete error source: Transient/Timeout/
//! Conflict recover locally, everything else surfaces to the caller.

use std::time::Duration;

/// Result type for message processing operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Errors that can occur while processing a message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessingError {
    /// Retryable I/O, transport nack, or other short-lived failure.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Per-operation deadline reached.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Input violates a contract. Surfaced, never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No handler registered for the message type.
    #[error("No handler registered for '{0}'")]
    HandlerNotFound(String),

    /// Referenced entity does not exist (e.g. saga instance for a
    /// non-initial event).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict on a versioned save or a
    /// compare-and-swap claim.
    #[error("Concurrency conflict: {0}")]
    Conflict(String),

    /// Circuit breaker is open, call rejected without reaching the handler.
    #[error("Circuit open for '{0}'")]
    CircuitOpen(String),

    /// Token bucket rejected the call.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Cooperative cancellation observed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Programmer error or invariant violation. The owning component shuts
    /// down and surfaces this.
    #[error("Fatal: {0}")]
    Fatal(String),
}

/// Stable category tag for a [`ProcessingError`].
///
/// Used where the error must round-trip through storage (idempotency
/// failure caching) or be matched without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transient,
    Timeout,
    Validation,
    HandlerNotFound,
    NotFound,
    Conflict,
    CircuitOpen,
    RateLimited,
    Cancelled,
    Fatal,
}

impl ErrorCategory {
    /// Stable string form, used as a storage key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::HandlerNotFound => "handler-not-found",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::CircuitOpen => "circuit-open",
            Self::RateLimited => "rate-limited",
            Self::Cancelled => "cancelled",
            Self::Fatal => "fatal",
        }
    }

    /// Parse the stable string form back into a category.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(Self::Transient),
            "timeout" => Some(Self::Timeout),
            "validation" => Some(Self::Validation),
            "handler-not-found" => Some(Self::HandlerNotFound),
            "not-found" => Some(Self::NotFound),
            "conflict" => Some(Self::Conflict),
            "circuit-open" => Some(Self::CircuitOpen),
            "rate-limited" => Some(Self::RateLimited),
            "cancelled" => Some(Self::Cancelled),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProcessingError {
    /// Category tag for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transient(_) => ErrorCategory::Transient,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::HandlerNotFound(_) => ErrorCategory::HandlerNotFound,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Conflict(_) => ErrorCategory::Conflict,
            Self::CircuitOpen(_) => ErrorCategory::CircuitOpen,
            Self::RateLimited(_) => ErrorCategory::RateLimited,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Fatal(_) => ErrorCategory::Fatal,
        }
    }

    /// Whether a retry policy may re-attempt after this error.
    ///
    /// Transient, Timeout, and Conflict recover locally; everything else
    /// surfaces upward.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout(_) | Self::Conflict(_)
        )
    }

    /// Reconstruct an error from a stored category tag and message.
    ///
    /// Used by the idempotency decorator to replay a cached failure.
    pub fn from_category(category: ErrorCategory, message: &str) -> Self {
        match category {
            ErrorCategory::Transient => Self::Transient(message.to_string()),
            ErrorCategory::Timeout => Self::Timeout(Duration::ZERO),
            ErrorCategory::Validation => Self::Validation(message.to_string()),
            ErrorCategory::HandlerNotFound => Self::HandlerNotFound(message.to_string()),
            ErrorCategory::NotFound => Self::NotFound(message.to_string()),
            ErrorCategory::Conflict => Self::Conflict(message.to_string()),
            ErrorCategory::CircuitOpen => Self::CircuitOpen(message.to_string()),
            ErrorCategory::RateLimited => Self::RateLimited(message.to_string()),
            ErrorCategory::Cancelled => Self::Cancelled,
            ErrorCategory::Fatal => Self::Fatal(message.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_categories() {
        assert!(ProcessingError::Transient("io".into()).is_retryable());
        assert!(ProcessingError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ProcessingError::Conflict("version".into()).is_retryable());

        assert!(!ProcessingError::Validation("bad input".into()).is_retryable());
        assert!(!ProcessingError::HandlerNotFound("orders.Place".into()).is_retryable());
        assert!(!ProcessingError::CircuitOpen("orders".into()).is_retryable());
        assert!(!ProcessingError::RateLimited("burst".into()).is_retryable());
        assert!(!ProcessingError::Cancelled.is_retryable());
        assert!(!ProcessingError::Fatal("bug".into()).is_retryable());
    }

    #[test]
    fn test_category_round_trip() {
        let categories = [
            ErrorCategory::Transient,
            ErrorCategory::Timeout,
            ErrorCategory::Validation,
            ErrorCategory::HandlerNotFound,
            ErrorCategory::NotFound,
            ErrorCategory::Conflict,
            ErrorCategory::CircuitOpen,
            ErrorCategory::RateLimited,
            ErrorCategory::Cancelled,
            ErrorCategory::Fatal,
        ];

        for category in categories {
            assert_eq!(ErrorCategory::parse(category.as_str()), Some(category));
        }
        assert_eq!(ErrorCategory::parse("bogus"), None);
    }

    #[test]
    fn test_from_category_reconstructs_variant() {
        let err = ProcessingError::from_category(ErrorCategory::Validation, "missing field");
        assert!(matches!(err, ProcessingError::Validation(_)));
        assert_eq!(err.category(), ErrorCategory::Validation);
    }
}
