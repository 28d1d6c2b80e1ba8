//! Recovery execution
//!
//! `attempt_recovery` never fails: every strategy outcome, handler error or
//! handler panic is folded into a [`RecoveryResult`] and appended to a bounded
//! history.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handlers::{
    DependencyInstallHandler, HandlerMap, HandlerOutcome, SharedHandler, into_map,
    manual_repair_suggestion, run_isolated,
};
use super::strategy::{EscalationReason, RecoveryStrategy, select_strategy};
use crate::checkpoint::{CheckpointStore, DEFAULT_CHECKPOINT_RETENTION};
use crate::retry::{BackoffStrategy, RetryConfig, RetryContext, RetryStrategyManager};
use crate::types::{ErrorCategory, ErrorClassification, FailureContext};

/// Recovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_recovery_attempts: u32,
    pub enable_rollback: bool,
    pub enable_fallback: bool,
    /// Allow IGNORE for low-severity, non-retryable failures
    pub ignore_low_severity: bool,
    pub history_limit: usize,
    pub checkpoint_retention: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            enable_rollback: true,
            enable_fallback: true,
            ignore_low_severity: false,
            history_limit: 500,
            checkpoint_retention: DEFAULT_CHECKPOINT_RETENTION,
        }
    }
}

/// Per-attempt lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPhase {
    Idle,
    Analyzing,
    Recovering,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub message: String,
    pub data: Map<String, Value>,
    pub strategy: RecoveryStrategy,
    pub phase: RecoveryPhase,
    pub checkpoint_id: Option<Uuid>,
    /// Operation invocations made by a RETRY strategy
    pub attempts: u32,
    pub duration_ms: u64,
}

impl RecoveryResult {
    /// `data.action`, when the strategy reported one
    pub fn action(&self) -> Option<&str> {
        self.data.get("action").and_then(Value::as_str)
    }
}

/// Entry in the recovery history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryRecord {
    pub id: Uuid,
    pub operation_id: String,
    pub classification: ErrorClassification,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    pub checkpoint_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StrategyCounts {
    pub attempts: u64,
    pub successes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStatistics {
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub by_strategy: BTreeMap<String, StrategyCounts>,
    pub history_len: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    history: VecDeque<RecoveryRecord>,
    by_strategy: BTreeMap<String, StrategyCounts>,
    successful: u64,
    failed: u64,
}

pub struct RecoveryManager {
    config: RecoveryConfig,
    retry_config: RetryConfig,
    retry: Arc<RetryStrategyManager>,
    checkpoints: Arc<CheckpointStore>,
    fallback_handlers: HandlerMap,
    repair_handlers: HandlerMap,
    ledger: Mutex<Ledger>,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fallback: Vec<_> = self.fallback_handlers.keys().collect();
        fallback.sort();
        let mut repair: Vec<_> = self.repair_handlers.keys().collect();
        repair.sort();
        f.debug_struct("RecoveryManager")
            .field("config", &self.config)
            .field("retry_config", &self.retry_config)
            .field("fallback_handlers", &fallback)
            .field("repair_handlers", &repair)
            .finish_non_exhaustive()
    }
}

impl RecoveryManager {
    pub fn new(
        config: RecoveryConfig,
        retry_config: RetryConfig,
        retry: Arc<RetryStrategyManager>,
    ) -> Self {
        let checkpoints = Arc::new(CheckpointStore::new(config.checkpoint_retention));
        let mut repair_handlers = HandlerMap::new();
        repair_handlers.insert(
            ErrorCategory::Dependency,
            Arc::new(DependencyInstallHandler) as SharedHandler,
        );

        Self {
            config,
            retry_config,
            retry,
            checkpoints,
            fallback_handlers: HandlerMap::new(),
            repair_handlers,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn with_fallback_handler(mut self, category: ErrorCategory, handler: SharedHandler) -> Self {
        self.fallback_handlers.insert(category, handler);
        self
    }

    /// Register a repair handler, replacing any built-in one for the category
    pub fn with_repair_handler(mut self, category: ErrorCategory, handler: SharedHandler) -> Self {
        self.repair_handlers.insert(category, handler);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn retry_manager(&self) -> &Arc<RetryStrategyManager> {
        &self.retry
    }

    pub async fn attempt_recovery(
        &self,
        classification: &ErrorClassification,
        context: &FailureContext,
    ) -> RecoveryResult {
        let clock = Instant::now();
        debug!(
            operation_id = %context.operation_id,
            phase = ?RecoveryPhase::Analyzing,
            "Analyzing failure"
        );
        let strategy = select_strategy(classification, context.retry_count, &self.config);
        info!(
            operation_id = %context.operation_id,
            category = %classification.category,
            severity = %classification.severity,
            strategy = %strategy,
            "Recovery strategy selected"
        );

        let checkpoint_id = strategy.is_mutating().then(|| {
            self.checkpoints
                .create(
                    &context.operation_id,
                    context.state.clone().unwrap_or(Value::Null),
                    context.metadata.clone(),
                )
                .id
        });

        debug!(
            operation_id = %context.operation_id,
            phase = ?RecoveryPhase::Recovering,
            ?checkpoint_id,
            "Executing strategy"
        );

        let execution = match strategy {
            RecoveryStrategy::Retry(backoff) => self.retry_operation(backoff, classification, context).await,
            RecoveryStrategy::Rollback => self.rollback(context),
            RecoveryStrategy::Fallback => {
                self.run_handler(&self.fallback_handlers, "fallback", classification, context)
                    .await
            }
            RecoveryStrategy::Repair => self.repair(classification, context).await,
            RecoveryStrategy::Escalate(reason) => escalated(reason),
            RecoveryStrategy::Ignore => Execution::from(HandlerOutcome::success(
                "Low-severity failure ignored",
                json!({ "action": "ignored" }),
            )),
        };

        let phase = if execution.outcome.success {
            RecoveryPhase::Completed
        } else {
            RecoveryPhase::Failed
        };

        let result = RecoveryResult {
            success: execution.outcome.success,
            message: execution.outcome.message,
            data: execution.outcome.data,
            strategy,
            phase,
            checkpoint_id: execution.checkpoint_id.or(checkpoint_id),
            attempts: execution.attempts,
            duration_ms: clock.elapsed().as_millis() as u64,
        };

        if result.success {
            info!(operation_id = %context.operation_id, strategy = %strategy, "Recovery completed");
        } else {
            warn!(
                operation_id = %context.operation_id,
                strategy = %strategy,
                message = %result.message,
                "Recovery did not succeed"
            );
        }

        self.record(classification, context, &result);
        result
    }

    async fn retry_operation(
        &self,
        backoff: BackoffStrategy,
        classification: &ErrorClassification,
        context: &FailureContext,
    ) -> Execution {
        let Some(operation) = context.operation.clone() else {
            return Execution::from(HandlerOutcome::failure(
                "No operation attached for retry",
                json!({ "action": "retry_skipped" }),
            ));
        };

        let config = self.retry_config.clone().with_strategy(backoff);
        let operation_key = if context.operation_key.is_empty() {
            context.operation_id.clone()
        } else {
            context.operation_key.clone()
        };
        let retry_ctx = RetryContext::new(operation_key, classification.category)
            .with_cancel(context.cancel.clone());

        let outcome = self
            .retry
            .execute_with_retry(
                move || {
                    let operation = operation.clone();
                    async move { operation.call().await }
                },
                &config,
                &retry_ctx,
            )
            .await;

        match outcome {
            Ok(retried) => {
                let attempts = retried.session.attempt_count();
                Execution {
                    outcome: HandlerOutcome::success(
                        format!("Operation succeeded after {attempts} attempt(s)"),
                        json!({
                            "action": "retried",
                            "attempts": attempts,
                            "session_id": retried.session.id,
                            "result": retried.value,
                        }),
                    ),
                    attempts,
                    checkpoint_id: None,
                }
            }
            Err(err) => Execution {
                outcome: HandlerOutcome::failure(
                    err.to_string(),
                    json!({
                        "action": "retry_failed",
                        "attempts": err.attempts(),
                        "error_code": err.last_error_code(),
                        "attempt_log": err.attempt_log(),
                    }),
                ),
                attempts: err.attempts(),
                checkpoint_id: None,
            },
        }
    }

    fn rollback(&self, context: &FailureContext) -> Execution {
        match self.checkpoints.latest_for(&context.operation_id) {
            Some(checkpoint) => Execution {
                outcome: HandlerOutcome::success(
                    format!("Restored checkpoint {}", checkpoint.id),
                    json!({
                        "action": "rolled_back",
                        "checkpoint_id": checkpoint.id,
                        "restored_state": checkpoint.captured_state,
                    }),
                ),
                attempts: 0,
                checkpoint_id: Some(checkpoint.id),
            },
            None => Execution::from(HandlerOutcome::failure(
                format!(
                    "No checkpoint available to roll back operation '{}'",
                    context.operation_id
                ),
                json!({ "action": "rollback_unavailable" }),
            )),
        }
    }

    async fn repair(
        &self,
        classification: &ErrorClassification,
        context: &FailureContext,
    ) -> Execution {
        if self.repair_handlers.contains_key(&classification.category) {
            return self
                .run_handler(&self.repair_handlers, "repair", classification, context)
                .await;
        }

        let suggestion = manual_repair_suggestion(classification.category);
        Execution::from(HandlerOutcome::failure(
            format!(
                "No automatic repair for {}: {suggestion}",
                classification.category
            ),
            json!({
                "action": "manual_repair_required",
                "suggestion": suggestion,
            }),
        ))
    }

    async fn run_handler(
        &self,
        handlers: &HandlerMap,
        kind: &str,
        classification: &ErrorClassification,
        context: &FailureContext,
    ) -> Execution {
        match handlers.get(&classification.category) {
            Some(handler) => {
                Execution::from(run_isolated(handler.clone(), classification, context).await)
            }
            None => Execution::from(HandlerOutcome::failure(
                format!(
                    "No {kind} handler registered for {}",
                    classification.category
                ),
                json!({ "action": format!("{kind}_unavailable") }),
            )),
        }
    }

    fn record(
        &self,
        classification: &ErrorClassification,
        context: &FailureContext,
        result: &RecoveryResult,
    ) {
        let record = RecoveryRecord {
            id: Uuid::new_v4(),
            operation_id: context.operation_id.clone(),
            classification: classification.clone(),
            strategy: result.strategy,
            success: result.success,
            message: result.message.clone(),
            duration_ms: result.duration_ms,
            checkpoint_id: result.checkpoint_id,
            timestamp: Utc::now(),
        };

        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let counts = ledger
            .by_strategy
            .entry(result.strategy.name().to_string())
            .or_default();
        counts.attempts += 1;
        if result.success {
            counts.successes += 1;
            ledger.successful += 1;
        } else {
            ledger.failed += 1;
        }

        let limit = self.config.history_limit.max(1);
        while ledger.history.len() >= limit {
            ledger.history.pop_front();
        }
        ledger.history.push_back(record);
    }

    pub fn recovery_statistics(&self) -> RecoveryStatistics {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        RecoveryStatistics {
            total_attempts: ledger.successful + ledger.failed,
            successful: ledger.successful,
            failed: ledger.failed,
            by_strategy: ledger.by_strategy.clone(),
            history_len: ledger.history.len(),
        }
    }

    /// Recovery records, oldest first
    pub fn history(&self) -> Vec<RecoveryRecord> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    pub fn reset(&self) {
        *self.ledger.lock().unwrap_or_else(PoisonError::into_inner) = Ledger::default();
        self.checkpoints.clear();
    }
}

struct Execution {
    outcome: HandlerOutcome,
    attempts: u32,
    /// Checkpoint consumed by the strategy itself (rollback)
    checkpoint_id: Option<Uuid>,
}

impl From<HandlerOutcome> for Execution {
    fn from(outcome: HandlerOutcome) -> Self {
        Self {
            outcome,
            attempts: 0,
            checkpoint_id: None,
        }
    }
}

fn escalated(reason: EscalationReason) -> Execution {
    Execution::from(HandlerOutcome {
        success: false,
        message: format!("Escalated: {}", reason.description()),
        data: into_map(json!({
            "action": "escalated",
            "reason": reason,
        })),
    })
}
