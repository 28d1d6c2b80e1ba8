//! Core types shared across the resilience pipeline
//!
//! `ErrorClassification` is produced by an external classifier and consumed
//! here as an immutable value. `FailureContext` carries everything the
//! pipeline needs about the failed operation plus an opaque metadata map that
//! is handed back unchanged on checkpoints and escalation records.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::escalation::EscalationLevel;
use crate::retry::OperationError;

/// Error categories reported by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    Resource,
    Authentication,
    Permission,
    Syntax,
    Dependency,
    Configuration,
    Validation,
    TestFailure,
    Build,
    Unknown,
}

impl ErrorCategory {
    /// Canonical name used as a key in metrics tables
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::Resource => "RESOURCE",
            Self::Authentication => "AUTHENTICATION",
            Self::Permission => "PERMISSION",
            Self::Syntax => "SYNTAX",
            Self::Dependency => "DEPENDENCY",
            Self::Configuration => "CONFIGURATION",
            Self::Validation => "VALIDATION",
            Self::TestFailure => "TEST_FAILURE",
            Self::Build => "BUILD",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse from string (case-insensitive, accepts `-` or space separators)
    pub fn from_string(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        Self::all()
            .into_iter()
            .find(|category| category.as_str() == normalized)
    }

    pub fn all() -> [Self; 13] {
        [
            Self::Network,
            Self::Timeout,
            Self::RateLimit,
            Self::Resource,
            Self::Authentication,
            Self::Permission,
            Self::Syntax,
            Self::Dependency,
            Self::Configuration,
            Self::Validation,
            Self::TestFailure,
            Self::Build,
            Self::Unknown,
        ]
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failure, as produced by the external classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: Severity,
    /// Classifier confidence in [0, 1]
    pub confidence: f64,
    pub retryable: bool,
    pub recurring: bool,
    pub recurrence_count: u32,
}

impl ErrorClassification {
    pub fn new(category: ErrorCategory, severity: Severity) -> Self {
        Self {
            category,
            severity,
            confidence: 1.0,
            retryable: false,
            recurring: false,
            recurrence_count: 0,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Mark as a recurring pattern seen `count` times
    pub fn recurring(mut self, count: u32) -> Self {
        self.recurring = true;
        self.recurrence_count = count;
        self
    }
}

/// A protected unit of work. The core only invokes it, never mutates it.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn call(&self) -> Result<Value, OperationError>;
}

#[async_trait]
impl<F, Fut> Operation for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, OperationError>> + Send,
{
    async fn call(&self) -> Result<Value, OperationError> {
        (self)().await
    }
}

pub type SharedOperation = Arc<dyn Operation>;

/// Failure handed to the orchestrator by the webhook/workflow layer
#[derive(Clone)]
pub struct FailedOperation {
    /// Partitions circuit breakers
    pub operation_key: String,
    pub error: OperationError,
    /// Re-invocable operation for the RETRY strategy
    pub operation: Option<SharedOperation>,
}

impl FailedOperation {
    pub fn new(operation_key: impl Into<String>, error: OperationError) -> Self {
        Self {
            operation_key: operation_key.into(),
            error,
            operation: None,
        }
    }

    pub fn with_operation(mut self, operation: SharedOperation) -> Self {
        self.operation = Some(operation);
        self
    }
}

impl std::fmt::Debug for FailedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailedOperation")
            .field("operation_key", &self.operation_key)
            .field("error", &self.error)
            .field("has_operation", &self.operation.is_some())
            .finish()
    }
}

/// Explicit resource-pressure signal (memory, disk, runner slots, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePressure {
    pub resource: String,
    /// Utilization in [0, 1]
    pub utilization: f64,
}

/// Caller-requested escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualEscalation {
    pub requested_by: String,
    pub reason: String,
    #[serde(default = "default_manual_level")]
    pub level: EscalationLevel,
}

fn default_manual_level() -> EscalationLevel {
    EscalationLevel::High
}

impl ManualEscalation {
    pub fn new(requested_by: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            requested_by: requested_by.into(),
            reason: reason.into(),
            level: default_manual_level(),
        }
    }
}

/// Everything the pipeline knows about a failed operation
#[derive(Clone, Default)]
pub struct FailureContext {
    pub operation_id: String,
    pub operation_key: String,
    pub operation: Option<SharedOperation>,
    /// Recovery attempts already made for this operation
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    /// Time budget for the operation; exceeding it fires SLA_BREACH
    pub time_budget: Option<Duration>,
    pub resource_pressure: Option<ResourcePressure>,
    pub manual_escalation: Option<ManualEscalation>,
    /// State captured into checkpoints before mutating recovery actions
    pub state: Option<Value>,
    /// Opaque passthrough (contextId, webhook delivery id, ...)
    pub metadata: Map<String, Value>,
    pub cancel: CancellationToken,
}

impl FailureContext {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            ..Default::default()
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_time_budget(mut self, started_at: DateTime<Utc>, budget: Duration) -> Self {
        self.started_at = Some(started_at);
        self.time_budget = Some(budget);
        self
    }

    pub fn with_resource_pressure(mut self, resource: impl Into<String>, utilization: f64) -> Self {
        self.resource_pressure = Some(ResourcePressure {
            resource: resource.into(),
            utilization,
        });
        self
    }

    pub fn with_manual_escalation(mut self, request: ManualEscalation) -> Self {
        self.manual_escalation = Some(request);
        self
    }

    /// Whether the operation has run past its time budget
    pub fn budget_exceeded(&self, now: DateTime<Utc>) -> bool {
        match (self.started_at, self.time_budget) {
            (Some(started), Some(budget)) => chrono::Duration::from_std(budget)
                .map(|budget| now - started > budget)
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl std::fmt::Debug for FailureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureContext")
            .field("operation_id", &self.operation_id)
            .field("operation_key", &self.operation_key)
            .field("has_operation", &self.operation.is_some())
            .field("retry_count", &self.retry_count)
            .field("started_at", &self.started_at)
            .field("time_budget", &self.time_budget)
            .field("resource_pressure", &self.resource_pressure)
            .field("manual_escalation", &self.manual_escalation)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
