//! Recovery strategy selection
//!
//! A fixed, first-match-wins decision table over the classification and the
//! number of recovery attempts already made for the operation.

use serde::{Deserialize, Serialize};

use super::manager::RecoveryConfig;
use crate::retry::BackoffStrategy;
use crate::types::{ErrorCategory, ErrorClassification, Severity};

/// Categories with a repair path (automatic or suggested)
pub const REPAIRABLE_CATEGORIES: [ErrorCategory; 4] = [
    ErrorCategory::Syntax,
    ErrorCategory::Dependency,
    ErrorCategory::Configuration,
    ErrorCategory::Validation,
];

/// Why a failure was escalated instead of recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationReason {
    RecurringPattern,
    CriticalAuthFailure,
    NoAutomaticStrategy,
}

impl EscalationReason {
    pub fn description(&self) -> &'static str {
        match self {
            Self::RecurringPattern => "recurring pattern",
            Self::CriticalAuthFailure => "critical auth failure",
            Self::NoAutomaticStrategy => "no automatic strategy",
        }
    }
}

/// The single recovery action chosen for a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Retry(BackoffStrategy),
    Rollback,
    Fallback,
    Repair,
    Escalate(EscalationReason),
    Ignore,
}

impl RecoveryStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Retry(_) => "RETRY",
            Self::Rollback => "ROLLBACK",
            Self::Fallback => "FALLBACK",
            Self::Repair => "REPAIR",
            Self::Escalate(_) => "ESCALATE",
            Self::Ignore => "IGNORE",
        }
    }

    /// Strategies that change the world and therefore need a checkpoint first
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Retry(_) | Self::Fallback | Self::Repair)
    }

    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::Escalate(_))
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry(backoff) => write!(f, "RETRY({backoff})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Backoff used when a category is retried
pub fn backoff_for(category: ErrorCategory) -> BackoffStrategy {
    match category {
        ErrorCategory::Network | ErrorCategory::Timeout => BackoffStrategy::ExponentialBackoff,
        ErrorCategory::RateLimit => BackoffStrategy::LinearBackoff,
        ErrorCategory::Resource => BackoffStrategy::ExponentialBackoffWithJitter,
        _ => BackoffStrategy::FixedDelay,
    }
}

/// Pick the recovery strategy; first matching rule wins.
pub fn select_strategy(
    classification: &ErrorClassification,
    retry_count: u32,
    config: &RecoveryConfig,
) -> RecoveryStrategy {
    let critical = classification.severity == Severity::Critical;

    if classification.recurring && classification.recurrence_count > 3 {
        return RecoveryStrategy::Escalate(EscalationReason::RecurringPattern);
    }
    // Must precede the rollback rule
    if critical && classification.category == ErrorCategory::Authentication {
        return RecoveryStrategy::Escalate(EscalationReason::CriticalAuthFailure);
    }
    if critical && config.enable_rollback {
        return RecoveryStrategy::Rollback;
    }
    if classification.retryable && retry_count < config.max_recovery_attempts {
        return RecoveryStrategy::Retry(backoff_for(classification.category));
    }
    if classification.retryable {
        return RecoveryStrategy::Fallback;
    }
    if REPAIRABLE_CATEGORIES.contains(&classification.category) {
        return RecoveryStrategy::Repair;
    }
    if classification.category == ErrorCategory::TestFailure && config.enable_fallback {
        return RecoveryStrategy::Fallback;
    }
    if config.ignore_low_severity && classification.severity == Severity::Low {
        return RecoveryStrategy::Ignore;
    }
    RecoveryStrategy::Escalate(EscalationReason::NoAutomaticStrategy)
}
