//! Escalation: trigger evaluation, SLA deadlines and notifier dispatch

pub mod engine;
pub mod notifier;
pub mod triggers;
pub mod types;

pub use engine::{EscalationConfig, EscalationEngine, EscalationStatistics};
pub use notifier::{Notifier, TracingNotifier};
pub use triggers::{CategoryCounts, TriggerInput, evaluate_triggers, resolve_level};
pub use types::{
    Escalation, EscalationEvaluation, EscalationLevel, EscalationStatus, NotificationRecord,
    Trigger, TriggerKind,
};
