//! Crate-level error taxonomy

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::escalation::{EscalationLevel, EscalationStatus};
use crate::recovery::RecoveryStrategy;
use crate::retry::RetryError;

pub type Result<T> = std::result::Result<T, ResilienceError>;

#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("Recovery via {strategy} failed: {message}")]
    RecoveryFailed {
        strategy: RecoveryStrategy,
        message: String,
    },

    /// Informational: the failure was handed to an operator
    #[error("Escalation required at level {level}")]
    EscalationRequired {
        level: EscalationLevel,
        escalation_id: Option<Uuid>,
    },

    #[error("Capacity exceeded: {active}/{limit} operations in flight")]
    CapacityExceeded { active: usize, limit: usize },

    #[error("Escalation not found: {0}")]
    EscalationNotFound(Uuid),

    #[error("Escalation {id} cannot move from {from} to {to}")]
    InvalidEscalationTransition {
        id: Uuid,
        from: EscalationStatus,
        to: EscalationStatus,
    },

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
