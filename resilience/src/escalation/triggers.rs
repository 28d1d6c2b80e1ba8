//! Trigger predicates
//!
//! Each trigger is evaluated independently and proposes a candidate level.
//! The final level is the maximum candidate. Promotion of a CRITICAL burst to
//! EMERGENCY is opt-in through `emergency_trigger_count`.

use chrono::{DateTime, Utc};

use super::engine::EscalationConfig;
use super::types::{EscalationLevel, Trigger, TriggerKind};
use crate::recovery::RecoveryResult;
use crate::types::{ErrorClassification, FailureContext};

/// Windowed counts for the failing category, including the current failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryCounts {
    pub errors: usize,
    pub recovery_failures: usize,
}

/// Everything the predicates look at
pub struct TriggerInput<'a> {
    pub classification: &'a ErrorClassification,
    pub recovery: &'a RecoveryResult,
    pub context: &'a FailureContext,
    pub counts: CategoryCounts,
    /// An active escalation of the same category is past its deadline
    pub category_overdue: bool,
    pub now: DateTime<Utc>,
}

pub fn evaluate_triggers(config: &EscalationConfig, input: &TriggerInput<'_>) -> Vec<Trigger> {
    let classification = input.classification;
    let severity_level = EscalationLevel::from_severity(classification.severity);
    let mut triggers = Vec::new();

    if classification.severity >= config.severity_threshold {
        triggers.push(Trigger {
            kind: TriggerKind::ErrorSeverity,
            level: severity_level,
            confidence: classification.confidence,
            details: format!("{} severity {} failure", classification.severity, classification.category),
        });
    }

    if !input.recovery.success {
        let failures = input.counts.recovery_failures;
        if failures >= config.recovery_failure_count as usize {
            triggers.push(Trigger {
                kind: TriggerKind::RecoveryFailure,
                level: EscalationLevel::High,
                confidence: 1.0,
                details: format!(
                    "{failures} failed recoveries for {} within the window",
                    classification.category
                ),
            });
        } else if input.recovery.strategy.is_escalation() {
            triggers.push(Trigger {
                kind: TriggerKind::RecoveryFailure,
                level: severity_level.max(EscalationLevel::Medium),
                confidence: 1.0,
                details: input.recovery.message.clone(),
            });
        }
    }

    if let Some(level) = scaled_level(input.counts.errors, config.error_frequency as usize) {
        triggers.push(Trigger {
            kind: TriggerKind::ErrorFrequency,
            level,
            confidence: 1.0,
            details: format!(
                "{} {} errors within the window",
                input.counts.errors, classification.category
            ),
        });
    }

    if classification.recurring
        && let Some(level) = scaled_level(
            classification.recurrence_count as usize,
            config.pattern_recurrence as usize,
        )
    {
        triggers.push(Trigger {
            kind: TriggerKind::PatternDetection,
            level,
            confidence: classification.confidence,
            details: format!(
                "Recurring pattern seen {} times",
                classification.recurrence_count
            ),
        });
    }

    if input.context.budget_exceeded(input.now) || input.category_overdue {
        let details = if input.category_overdue {
            format!("Open {} escalation past its SLA deadline", classification.category)
        } else {
            "Operation exceeded its time budget".to_string()
        };
        triggers.push(Trigger {
            kind: TriggerKind::SlaBreach,
            level: EscalationLevel::High,
            confidence: 1.0,
            details,
        });
    }

    if let Some(pressure) = &input.context.resource_pressure
        && pressure.utilization >= config.resource_utilization_threshold
    {
        triggers.push(Trigger {
            kind: TriggerKind::ResourceExhaustion,
            level: EscalationLevel::Critical,
            confidence: 1.0,
            details: format!(
                "{} at {:.0}% utilization",
                pressure.resource,
                pressure.utilization * 100.0
            ),
        });
    }

    if let Some(request) = &input.context.manual_escalation {
        triggers.push(Trigger {
            kind: TriggerKind::ManualRequest,
            level: request.level,
            confidence: 1.0,
            details: format!("Requested by {}: {}", request.requested_by, request.reason),
        });
    }

    triggers
}

/// MEDIUM at the threshold, HIGH at twice the threshold
fn scaled_level(count: usize, threshold: usize) -> Option<EscalationLevel> {
    if threshold == 0 || count < threshold {
        None
    } else if count >= threshold.saturating_mul(2) {
        Some(EscalationLevel::High)
    } else {
        Some(EscalationLevel::Medium)
    }
}

/// Final level for a set of fired triggers: the maximum candidate.
///
/// With `emergency_trigger_count` set, a CRITICAL maximum backed by at least
/// that many triggers is promoted to EMERGENCY.
pub fn resolve_level(
    triggers: &[Trigger],
    emergency_trigger_count: Option<usize>,
) -> EscalationLevel {
    let level = triggers
        .iter()
        .map(|t| t.level)
        .max()
        .unwrap_or(EscalationLevel::None);

    if level == EscalationLevel::Critical
        && emergency_trigger_count.is_some_and(|count| triggers.len() >= count)
    {
        EscalationLevel::Emergency
    } else {
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{EscalationReason, RecoveryPhase, RecoveryStrategy};
    use crate::types::{ErrorCategory, ManualEscalation, Severity};
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    fn recovery(success: bool, strategy: RecoveryStrategy) -> RecoveryResult {
        RecoveryResult {
            success,
            message: "test".to_string(),
            data: Map::new(),
            strategy,
            phase: if success {
                RecoveryPhase::Completed
            } else {
                RecoveryPhase::Failed
            },
            checkpoint_id: None,
            attempts: 0,
            duration_ms: 0,
        }
    }

    fn kinds(triggers: &[Trigger]) -> Vec<TriggerKind> {
        triggers.iter().map(|t| t.kind).collect()
    }

    fn run(
        classification: &ErrorClassification,
        recovery: &RecoveryResult,
        context: &FailureContext,
        counts: CategoryCounts,
    ) -> Vec<Trigger> {
        evaluate_triggers(
            &EscalationConfig::default(),
            &TriggerInput {
                classification,
                recovery,
                context,
                counts,
                category_overdue: false,
                now: Utc::now(),
            },
        )
    }

    #[test]
    fn test_quiet_failure_fires_nothing() {
        let c = ErrorClassification::new(ErrorCategory::Network, Severity::Medium);
        let r = recovery(true, RecoveryStrategy::Rollback);
        let triggers = run(&c, &r, &FailureContext::default(), CategoryCounts::default());
        assert!(triggers.is_empty());
        assert_eq!(resolve_level(&triggers, None), EscalationLevel::None);
    }

    #[test]
    fn test_severity_and_frequency_resolve_to_critical() {
        let c = ErrorClassification::new(ErrorCategory::Network, Severity::Critical);
        let r = recovery(true, RecoveryStrategy::Rollback);
        let counts = CategoryCounts {
            errors: 10,
            recovery_failures: 0,
        };
        let triggers = run(&c, &r, &FailureContext::default(), counts);
        assert_eq!(
            kinds(&triggers),
            vec![TriggerKind::ErrorSeverity, TriggerKind::ErrorFrequency]
        );
        assert_eq!(triggers[1].level, EscalationLevel::Medium);
        assert_eq!(resolve_level(&triggers, None), EscalationLevel::Critical);
    }

    #[test]
    fn test_explicit_escalation_counts_as_recovery_failure() {
        let c = ErrorClassification::new(ErrorCategory::Unknown, Severity::Low);
        let r = recovery(
            false,
            RecoveryStrategy::Escalate(EscalationReason::NoAutomaticStrategy),
        );
        let counts = CategoryCounts {
            errors: 1,
            recovery_failures: 1,
        };
        let triggers = run(&c, &r, &FailureContext::default(), counts);
        assert_eq!(kinds(&triggers), vec![TriggerKind::RecoveryFailure]);
        assert_eq!(triggers[0].level, EscalationLevel::Medium);
    }

    #[test]
    fn test_recovery_failure_threshold() {
        let c = ErrorClassification::new(ErrorCategory::Build, Severity::Low);
        let r = recovery(false, RecoveryStrategy::Fallback);
        let below = CategoryCounts {
            errors: 4,
            recovery_failures: 4,
        };
        assert!(run(&c, &r, &FailureContext::default(), below).is_empty());

        let at = CategoryCounts {
            errors: 5,
            recovery_failures: 5,
        };
        let triggers = run(&c, &r, &FailureContext::default(), at);
        assert_eq!(kinds(&triggers), vec![TriggerKind::RecoveryFailure]);
        assert_eq!(triggers[0].level, EscalationLevel::High);
    }

    #[test]
    fn test_frequency_and_pattern_scale_to_high() {
        let c = ErrorClassification::new(ErrorCategory::Timeout, Severity::Low)
            .retryable(true)
            .recurring(10);
        let r = recovery(true, RecoveryStrategy::Fallback);
        let counts = CategoryCounts {
            errors: 20,
            recovery_failures: 0,
        };
        let triggers = run(&c, &r, &FailureContext::default(), counts);
        assert_eq!(
            kinds(&triggers),
            vec![TriggerKind::ErrorFrequency, TriggerKind::PatternDetection]
        );
        assert!(triggers.iter().all(|t| t.level == EscalationLevel::High));
    }

    #[test]
    fn test_context_triggers() {
        let c = ErrorClassification::new(ErrorCategory::Resource, Severity::Low);
        let r = recovery(true, RecoveryStrategy::Fallback);
        let context = FailureContext::new("op")
            .with_time_budget(
                Utc::now() - chrono::Duration::hours(2),
                std::time::Duration::from_secs(60),
            )
            .with_resource_pressure("runner-disk", 0.95)
            .with_manual_escalation(ManualEscalation::new("oncall", "stuck deploy"));

        let triggers = run(&c, &r, &context, CategoryCounts::default());
        assert_eq!(
            kinds(&triggers),
            vec![
                TriggerKind::SlaBreach,
                TriggerKind::ResourceExhaustion,
                TriggerKind::ManualRequest
            ]
        );
        assert_eq!(resolve_level(&triggers, None), EscalationLevel::Critical);
        assert_eq!(resolve_level(&triggers, Some(3)), EscalationLevel::Emergency);
        assert_eq!(resolve_level(&triggers, Some(4)), EscalationLevel::Critical);
    }

    #[test]
    fn test_critical_burst_stays_critical_by_default() {
        let c = ErrorClassification::new(ErrorCategory::Authentication, Severity::Critical);
        let r = recovery(
            false,
            RecoveryStrategy::Escalate(EscalationReason::CriticalAuthFailure),
        );
        let counts = CategoryCounts {
            errors: 10,
            recovery_failures: 10,
        };
        let triggers = run(&c, &r, &FailureContext::default(), counts);
        assert_eq!(
            kinds(&triggers),
            vec![
                TriggerKind::ErrorSeverity,
                TriggerKind::RecoveryFailure,
                TriggerKind::ErrorFrequency
            ]
        );
        let config = EscalationConfig::default();
        assert_eq!(
            resolve_level(&triggers, config.emergency_trigger_count),
            EscalationLevel::Critical
        );
    }

    #[test]
    fn test_manual_emergency_request_is_the_max() {
        let c = ErrorClassification::new(ErrorCategory::Build, Severity::Low);
        let r = recovery(true, RecoveryStrategy::Fallback);
        let mut request = ManualEscalation::new("incident-commander", "prod down");
        request.level = EscalationLevel::Emergency;
        let context = FailureContext::new("op").with_manual_escalation(request);

        let triggers = run(&c, &r, &context, CategoryCounts::default());
        assert_eq!(resolve_level(&triggers, None), EscalationLevel::Emergency);
    }

    #[test]
    fn test_pressure_below_threshold_is_quiet() {
        let c = ErrorClassification::new(ErrorCategory::Resource, Severity::Low);
        let r = recovery(true, RecoveryStrategy::Fallback);
        let context = FailureContext::new("op").with_resource_pressure("memory", 0.5);
        assert!(run(&c, &r, &context, CategoryCounts::default()).is_empty());
    }
}
