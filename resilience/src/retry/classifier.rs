//! Error classification for retry decisions
//!
//! Operations fail with an [`OperationError`] carrying an optional machine
//! code. A small set of codes is permanent; everything else is worth another
//! attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Codes that never succeed on a retry
pub const NON_RETRYABLE_CODES: [&str; 4] = [
    "AUTHENTICATION_FAILED",
    "AUTHORIZATION_FAILED",
    "INVALID_REQUEST",
    "NOT_FOUND",
];

/// Code attached to attempts that lost the race against the attempt timeout
pub const TIMEOUT_CODE: &str = "TIMEOUT";

/// Top-level error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient errors that should be retried with backoff
    Retryable,

    /// Permanent errors that should NOT be retried
    Permanent(PermanentReason),
}

/// Why an error is permanent
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PermanentReason {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("authorization failed")]
    AuthorizationFailed,

    #[error("invalid request")]
    InvalidRequest,

    #[error("resource not found")]
    NotFound,
}

impl PermanentReason {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "AUTHENTICATION_FAILED" => Some(Self::AuthenticationFailed),
            "AUTHORIZATION_FAILED" => Some(Self::AuthorizationFailed),
            "INVALID_REQUEST" => Some(Self::InvalidRequest),
            "NOT_FOUND" => Some(Self::NotFound),
            _ => None,
        }
    }
}

/// Trait for error classification
pub trait RetryClassifiable {
    fn classify(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorClass::Retryable)
    }

    fn suggested_backoff(&self) -> Option<Duration>;
}

/// Error returned by a protected operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// Machine-readable code (`ECONNREFUSED`, `TIMEOUT`, `NOT_FOUND`, ...)
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    /// Server-suggested wait before the next attempt (rate limits)
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::with_code(
            TIMEOUT_CODE,
            format!("Operation timed out after {timeout_ms}ms"),
        )
    }

    pub fn retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for OperationError {}

impl RetryClassifiable for OperationError {
    fn classify(&self) -> ErrorClass {
        match self.code().and_then(PermanentReason::from_code) {
            Some(reason) => ErrorClass::Permanent(reason),
            None => ErrorClass::Retryable,
        }
    }

    fn suggested_backoff(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_codes() {
        for code in NON_RETRYABLE_CODES {
            let err = OperationError::with_code(code, "nope");
            assert!(!err.is_retryable(), "{code} should be permanent");
            assert!(matches!(err.classify(), ErrorClass::Permanent(_)));
        }
    }

    #[test]
    fn test_transient_codes() {
        let err = OperationError::with_code("ECONNREFUSED", "connection refused");
        assert!(err.is_retryable());
        assert!(OperationError::timeout(100).is_retryable());
        assert!(OperationError::new("no code at all").is_retryable());
    }

    #[test]
    fn test_suggested_backoff_from_retry_after() {
        let err = OperationError::with_code("RATE_LIMITED", "slow down").retry_after(1500);
        assert_eq!(err.suggested_backoff(), Some(Duration::from_millis(1500)));
        assert_eq!(OperationError::new("x").suggested_backoff(), None);
    }

    #[test]
    fn test_display_includes_code() {
        let err = OperationError::with_code("NOT_FOUND", "missing artifact");
        assert_eq!(err.to_string(), "[NOT_FOUND] missing artifact");
        assert_eq!(OperationError::new("plain").to_string(), "plain");
    }
}
