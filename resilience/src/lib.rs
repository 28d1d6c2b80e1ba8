//! Resilience core for CI/CD automation
//!
//! Given a failed operation and a classification of why it failed, this crate
//! decides how to recover (retry, roll back, fall back, repair or escalate),
//! executes that decision under a concurrency ceiling, and tracks SLA
//! deadlines for failures that need a human or automated agent.
//!
//! Layering, leaves first:
//! - [`retry::circuit_breaker`]: per-key three-state breaker
//! - [`retry`]: backoff policies, adaptive metrics and the retry loop
//! - [`checkpoint`]: bounded snapshot store used for rollback
//! - [`recovery`]: strategy decision table and execution
//! - [`escalation`]: trigger evaluation, SLA deadlines, notifier dispatch
//! - [`orchestrator`]: admission control and the recover → escalate pipeline

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod escalation;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use error::{ResilienceError, Result};
pub use escalation::{
    Escalation, EscalationEngine, EscalationEvaluation, EscalationLevel, EscalationStatus,
    Notifier, TracingNotifier, Trigger, TriggerKind,
};
pub use orchestrator::{HandlingResult, Orchestrator, ResilienceStatistics};
pub use recovery::{RecoveryManager, RecoveryResult, RecoveryStrategy};
pub use retry::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerRegistry, CircuitState, OperationError,
    RetryConfig, RetryContext, RetryError, RetryStrategyManager,
};
pub use types::{
    ErrorCategory, ErrorClassification, FailedOperation, FailureContext, ManualEscalation,
    Operation, ResourcePressure, Severity, SharedOperation,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
