//! Recovery strategy selection and execution
//!
//! - [`strategy`]: the first-match decision table
//! - [`handlers`]: pluggable fallback/repair handlers keyed by category
//! - [`manager`]: checkpointing, execution and bounded history

pub mod handlers;
pub mod manager;
pub mod strategy;

pub use handlers::{
    DependencyInstallHandler, HandlerMap, HandlerOutcome, RecoveryHandler, SharedHandler,
};
pub use manager::{
    RecoveryConfig, RecoveryManager, RecoveryPhase, RecoveryRecord, RecoveryResult,
    RecoveryStatistics, StrategyCounts,
};
pub use strategy::{EscalationReason, RecoveryStrategy, backoff_for, select_strategy};
