//! Retry logic with pluggable backoff
//!
//! This module provides:
//! - Error classification from operation error codes (retryable vs permanent)
//! - Fixed, linear, exponential, jittered and adaptive backoff
//! - Per-key circuit breakers gating every attempt
//! - Per-category adaptive metrics learned from session outcomes
//! - Cancellation support via `CancellationToken`

pub mod adaptive;
pub mod circuit_breaker;
pub mod classifier;
pub mod manager;
pub mod strategy;

pub use adaptive::{AdaptiveConfig, AdaptiveMetrics, CategoryMetrics};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
pub use classifier::{ErrorClass, OperationError, PermanentReason, RetryClassifiable};
pub use manager::{
    Attempt, Retried, RetryContext, RetrySession, RetryStatistics, RetryStrategyManager,
    SessionState,
};
pub use strategy::{BackoffStrategy, RetryConfig, compute_delay};

/// Retry module result type
pub type Result<T> = std::result::Result<T, RetryError>;

/// Retry error types
///
/// Every variant carries the attempts made before the session stopped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError {
    #[error("Retries exhausted after {} attempts: {last_error}", .attempts.len())]
    Exhausted {
        last_error: OperationError,
        attempts: Vec<Attempt>,
    },

    /// Empty `attempts` means the breaker rejected the call up front
    #[error("Circuit breaker open for '{operation_key}' after {} attempts", .attempts.len())]
    CircuitOpen {
        operation_key: String,
        attempts: Vec<Attempt>,
    },

    #[error("Permanent error (not retryable): {error}")]
    Permanent {
        error: OperationError,
        attempts: Vec<Attempt>,
    },

    /// External cancellation requested
    #[error("Retry aborted by cancellation after {} attempts", .attempts.len())]
    Aborted { attempts: Vec<Attempt> },
}

impl RetryError {
    /// Attempts made before the error surfaced, oldest first
    pub fn attempt_log(&self) -> &[Attempt] {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::CircuitOpen { attempts, .. }
            | Self::Permanent { attempts, .. }
            | Self::Aborted { attempts } => attempts,
        }
    }

    /// Number of operation invocations made before the error surfaced
    pub fn attempts(&self) -> u32 {
        self.attempt_log().len() as u32
    }

    /// The last error returned by the operation, when the variant keeps it
    pub fn last_error(&self) -> Option<&OperationError> {
        match self {
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Permanent { error, .. } => Some(error),
            Self::CircuitOpen { .. } | Self::Aborted { .. } => None,
        }
    }

    /// Code of the most recent failed attempt
    pub fn last_error_code(&self) -> Option<&str> {
        self.attempt_log()
            .iter()
            .rev()
            .find(|a| !a.success)
            .and_then(|a| a.error_code.as_deref())
    }
}
