//! Admission control and the recover → escalate pipeline
//!
//! [`Orchestrator::handle`] is the single entry point for a failed CI/CD
//! operation: it admits the call under `max_concurrent_operations`, runs
//! recovery, always evaluates escalation, then folds the outcome into the
//! aggregate metrics.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ResilienceConfig;
use crate::error::{ResilienceError, Result};
use crate::escalation::{
    Escalation, EscalationEngine, EscalationEvaluation, EscalationStatistics, Notifier,
    TracingNotifier,
};
use crate::recovery::{RecoveryManager, RecoveryResult, RecoveryStatistics, SharedHandler};
use crate::retry::{CategoryMetrics, CircuitBreakerStats, RetryStatistics, RetryStrategyManager};
use crate::types::{ErrorCategory, ErrorClassification, FailedOperation, FailureContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Admission ceiling; calls beyond it are rejected, not queued
    pub max_concurrent_operations: usize,
    /// Window used for operations-per-minute
    pub metrics_window_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 10,
            metrics_window_secs: 60,
        }
    }
}

/// Outcome of [`Orchestrator::handle`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlingResult {
    pub operation_id: String,
    /// Mirrors `recovery.success`
    pub success: bool,
    pub duration_ms: u64,
    pub recovery: RecoveryResult,
    pub escalation: EscalationEvaluation,
}

impl HandlingResult {
    /// Convert into the typed error taxonomy. An escalation takes precedence
    /// over a failed recovery.
    pub fn into_result(self) -> Result<Self> {
        if self.escalation.required {
            return Err(ResilienceError::EscalationRequired {
                level: self.escalation.level,
                escalation_id: self.escalation.escalation_id,
            });
        }
        if !self.recovery.success {
            return Err(ResilienceError::RecoveryFailed {
                strategy: self.recovery.strategy,
                message: self.recovery.message,
            });
        }
        Ok(self)
    }
}

/// An operation currently inside the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveOperation {
    pub id: Uuid,
    pub operation_id: String,
    pub operation_key: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResilienceStatistics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub rejected_operations: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub operations_per_minute: f64,
    pub active_operations: usize,
    pub max_concurrent_operations: usize,
    pub retry: RetryStatistics,
    pub recovery: RecoveryStatistics,
    pub adaptive: BTreeMap<String, CategoryMetrics>,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub escalation: EscalationStatistics,
}

#[derive(Debug, Default)]
struct Aggregates {
    total: u64,
    successful: u64,
    failed: u64,
    rejected: u64,
    total_duration_ms: u64,
    completions: VecDeque<Instant>,
}

impl Aggregates {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .completions
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            self.completions.pop_front();
        }
    }
}

/// Releases the admission slot and the active record when dropped, including
/// when the `handle` future is cancelled or unwinds.
struct ActiveGuard<'a> {
    in_flight: &'a AtomicUsize,
    active: &'a Mutex<HashMap<Uuid, ActiveOperation>>,
    id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct OrchestratorBuilder {
    config: ResilienceConfig,
    notifier: Option<Arc<dyn Notifier>>,
    fallback_handlers: Vec<(ErrorCategory, SharedHandler)>,
    repair_handlers: Vec<(ErrorCategory, SharedHandler)>,
}

impl OrchestratorBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn fallback_handler(mut self, category: ErrorCategory, handler: SharedHandler) -> Self {
        self.fallback_handlers.push((category, handler));
        self
    }

    pub fn repair_handler(mut self, category: ErrorCategory, handler: SharedHandler) -> Self {
        self.repair_handlers.push((category, handler));
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let retry = Arc::new(RetryStrategyManager::new(
            config.circuit_breaker.clone(),
            config.adaptive.clone(),
        ));

        let mut recovery =
            RecoveryManager::new(config.recovery.clone(), config.retry.clone(), retry);
        for (category, handler) in self.fallback_handlers {
            recovery = recovery.with_fallback_handler(category, handler);
        }
        for (category, handler) in self.repair_handlers {
            recovery = recovery.with_repair_handler(category, handler);
        }

        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn Notifier>);
        let escalation = EscalationEngine::new(config.escalation.clone(), notifier);

        Orchestrator {
            config,
            recovery,
            escalation,
            in_flight: AtomicUsize::new(0),
            active: Mutex::new(HashMap::new()),
            aggregates: Mutex::new(Aggregates::default()),
        }
    }
}

pub struct Orchestrator {
    config: ResilienceConfig,
    recovery: RecoveryManager,
    escalation: EscalationEngine,
    in_flight: AtomicUsize,
    active: Mutex<HashMap<Uuid, ActiveOperation>>,
    aggregates: Mutex<Aggregates>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config.orchestrator)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(config: ResilienceConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            notifier: None,
            fallback_handlers: Vec::new(),
            repair_handlers: Vec::new(),
        }
    }

    /// Orchestrator with the built-in notifier and handlers
    pub fn new(config: ResilienceConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn escalation(&self) -> &EscalationEngine {
        &self.escalation
    }

    /// Recover from `failure`, then evaluate escalation.
    ///
    /// Fails only with [`ResilienceError::CapacityExceeded`]; every other
    /// outcome is reported through the returned [`HandlingResult`].
    pub async fn handle(
        &self,
        failure: FailedOperation,
        classification: ErrorClassification,
        context: FailureContext,
    ) -> Result<HandlingResult> {
        let limit = self.config.orchestrator.max_concurrent_operations;
        let admitted = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            });
        if let Err(active) = admitted {
            self.lock_aggregates().rejected += 1;
            warn!(
                operation_key = %failure.operation_key,
                active,
                limit,
                "Operation rejected: concurrency ceiling reached"
            );
            return Err(ResilienceError::CapacityExceeded { active, limit });
        }

        let context = merge_context(context, failure);
        let record = ActiveOperation {
            id: Uuid::new_v4(),
            operation_id: context.operation_id.clone(),
            operation_key: context.operation_key.clone(),
            started_at: Utc::now(),
        };
        let _guard = ActiveGuard {
            in_flight: &self.in_flight,
            active: &self.active,
            id: record.id,
        };
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record);

        let clock = Instant::now();
        info!(
            operation_id = %context.operation_id,
            operation_key = %context.operation_key,
            category = %classification.category,
            severity = %classification.severity,
            "Handling failed operation"
        );

        let recovery = self.recovery.attempt_recovery(&classification, &context).await;
        let escalation = self
            .escalation
            .evaluate_escalation(&classification, &recovery, &context)
            .await;

        let duration_ms = clock.elapsed().as_millis() as u64;
        self.record_completion(recovery.success, duration_ms);

        info!(
            operation_id = %context.operation_id,
            success = recovery.success,
            strategy = %recovery.strategy,
            escalated = escalation.required,
            duration_ms,
            "Failed operation handled"
        );

        Ok(HandlingResult {
            operation_id: context.operation_id,
            success: recovery.success,
            duration_ms,
            recovery,
            escalation,
        })
    }

    /// Operations currently inside the pipeline, oldest first
    pub fn active_operations(&self) -> Vec<ActiveOperation> {
        let mut records: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    pub fn get_statistics(&self) -> ResilienceStatistics {
        let window = Duration::from_secs(self.config.orchestrator.metrics_window_secs.max(1));
        let (total, successful, failed, rejected, average_duration_ms, operations_per_minute) = {
            let mut agg = self.lock_aggregates();
            agg.prune(Instant::now(), window);
            let average = if agg.total == 0 {
                0.0
            } else {
                agg.total_duration_ms as f64 / agg.total as f64
            };
            let per_minute = agg.completions.len() as f64 * 60.0 / window.as_secs_f64();
            (agg.total, agg.successful, agg.failed, agg.rejected, average, per_minute)
        };
        let retry = self.recovery.retry_manager();

        ResilienceStatistics {
            total_operations: total,
            successful_operations: successful,
            failed_operations: failed,
            rejected_operations: rejected,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            average_duration_ms,
            operations_per_minute,
            active_operations: self.in_flight.load(Ordering::Acquire),
            max_concurrent_operations: self.config.orchestrator.max_concurrent_operations,
            retry: retry.statistics(),
            recovery: self.recovery.recovery_statistics(),
            adaptive: retry.metrics().snapshot(),
            circuit_breakers: retry.breakers().snapshots(),
            escalation: self.escalation.statistics(),
        }
    }

    pub fn get_active_escalations(&self) -> Vec<Escalation> {
        self.escalation.get_active_escalations()
    }

    pub fn acknowledge_escalation(&self, id: Uuid, who: &str) -> Result<Escalation> {
        self.escalation.acknowledge_escalation(id, who)
    }

    pub fn mark_in_progress(&self, id: Uuid, who: &str) -> Result<Escalation> {
        self.escalation.mark_in_progress(id, who)
    }

    pub fn resolve_escalation(&self, id: Uuid, resolution: &str, who: &str) -> Result<Escalation> {
        self.escalation.resolve_escalation(id, resolution, who)
    }

    pub fn close_escalation(&self, id: Uuid, reason: &str, who: &str) -> Result<Escalation> {
        self.escalation.close_escalation(id, reason, who)
    }

    pub fn check_sla_breaches(&self) -> Vec<Escalation> {
        self.escalation.check_sla_breaches()
    }

    /// Clear adaptive metrics, breakers, histories and counters. Active
    /// escalations are kept.
    pub fn reset(&self) {
        self.recovery.retry_manager().reset();
        self.recovery.reset();
        self.escalation.reset_tracking();
        *self.lock_aggregates() = Aggregates::default();
        info!("Resilience state reset");
    }

    fn record_completion(&self, success: bool, duration_ms: u64) {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.orchestrator.metrics_window_secs.max(1));
        let mut agg = self.lock_aggregates();
        agg.total += 1;
        if success {
            agg.successful += 1;
        } else {
            agg.failed += 1;
        }
        agg.total_duration_ms += duration_ms;
        agg.completions.push_back(now);
        agg.prune(now, window);
    }

    fn lock_aggregates(&self) -> std::sync::MutexGuard<'_, Aggregates> {
        self.aggregates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fill the context from the failed operation without overriding what the
/// caller already set.
fn merge_context(mut context: FailureContext, failure: FailedOperation) -> FailureContext {
    if context.operation_id.is_empty() {
        context.operation_id = Uuid::new_v4().to_string();
    }
    if context.operation_key.is_empty() {
        context.operation_key = failure.operation_key;
    }
    if context.operation.is_none() {
        context.operation = failure.operation;
    }
    context
        .metadata
        .entry("last_error")
        .or_insert_with(|| Value::String(failure.error.to_string()));
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::EscalationLevel;
    use crate::recovery::{HandlerOutcome, RecoveryStrategy};
    use crate::retry::OperationError;
    use crate::types::Severity;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn fast_config() -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config.retry.jitter_factor = 0.0;
        config
    }

    fn failure(key: &str) -> FailedOperation {
        FailedOperation::new(key, OperationError::new("boom"))
    }

    fn slow_fallback(delay: Duration) -> SharedHandler {
        Arc::new(move |_c: ErrorClassification, _ctx: FailureContext| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, anyhow::Error>(HandlerOutcome::success(
                "fell back",
                json!({ "action": "fallback" }),
            ))
        })
    }

    #[tokio::test]
    async fn test_handle_fills_operation_id_and_key() {
        let orchestrator = Orchestrator::new(fast_config());
        let classification = ErrorClassification::new(ErrorCategory::Configuration, Severity::Medium);

        let result = orchestrator
            .handle(failure("deploy:staging"), classification, FailureContext::default())
            .await
            .expect("admitted");

        assert!(!result.operation_id.is_empty());
        assert!(Uuid::parse_str(&result.operation_id).is_ok());
        assert_eq!(orchestrator.active_operations().len(), 0);
    }

    #[tokio::test]
    async fn test_successful_fallback_updates_statistics() {
        let orchestrator = Orchestrator::builder(fast_config())
            .fallback_handler(ErrorCategory::TestFailure, slow_fallback(Duration::ZERO))
            .build();
        let classification = ErrorClassification::new(ErrorCategory::TestFailure, Severity::Medium);

        let result = orchestrator
            .handle(failure("test:unit"), classification, FailureContext::new("run-1"))
            .await
            .expect("admitted");

        assert!(result.success);
        assert_eq!(result.recovery.strategy, RecoveryStrategy::Fallback);
        assert!(!result.escalation.required);

        let stats = orchestrator.get_statistics();
        assert_eq!(stats.total_operations, 1);
        assert_eq!(stats.successful_operations, 1);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.operations_per_minute, 1.0);
        assert_eq!(stats.active_operations, 0);
        assert_eq!(stats.recovery.total_attempts, 1);
    }

    #[tokio::test]
    async fn test_into_result_maps_to_taxonomy() {
        let orchestrator = Orchestrator::new(fast_config());

        let critical_auth =
            ErrorClassification::new(ErrorCategory::Authentication, Severity::Critical);
        let escalated = orchestrator
            .handle(failure("auth"), critical_auth, FailureContext::new("run-auth"))
            .await
            .expect("admitted");
        match escalated.into_result() {
            Err(ResilienceError::EscalationRequired { level, escalation_id }) => {
                assert_eq!(level, EscalationLevel::Critical);
                assert!(escalation_id.is_some());
            }
            other => panic!("expected EscalationRequired, got {other:?}"),
        }

        // Non-retryable with no fallback handler registered
        let test_failure = ErrorClassification::new(ErrorCategory::TestFailure, Severity::Low);
        let failed = orchestrator
            .handle(failure("test"), test_failure, FailureContext::new("run-test"))
            .await
            .expect("admitted");
        assert!(matches!(
            failed.into_result(),
            Err(ResilienceError::RecoveryFailed { strategy: RecoveryStrategy::Fallback, .. })
        ));
    }

    #[tokio::test]
    async fn test_capacity_rejection_is_immediate() {
        let mut config = fast_config();
        config.orchestrator.max_concurrent_operations = 1;
        let orchestrator = Arc::new(
            Orchestrator::builder(config)
                .fallback_handler(
                    ErrorCategory::TestFailure,
                    slow_fallback(Duration::from_millis(200)),
                )
                .build(),
        );
        let classification = ErrorClassification::new(ErrorCategory::TestFailure, Severity::Medium);

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            let classification = classification.clone();
            tokio::spawn(async move {
                orchestrator
                    .handle(failure("a"), classification, FailureContext::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(orchestrator.active_operations().len(), 1);

        let second = orchestrator
            .handle(failure("b"), classification, FailureContext::default())
            .await;
        assert!(matches!(
            second,
            Err(ResilienceError::CapacityExceeded { active: 1, limit: 1 })
        ));

        assert!(first.await.expect("join").is_ok());
        let stats = orchestrator.get_statistics();
        assert_eq!(stats.rejected_operations, 1);
        assert_eq!(stats.total_operations, 1);
    }

    #[tokio::test]
    async fn test_slot_released_when_future_dropped() {
        let mut config = fast_config();
        config.orchestrator.max_concurrent_operations = 1;
        let orchestrator = Orchestrator::builder(config)
            .fallback_handler(ErrorCategory::TestFailure, slow_fallback(Duration::from_secs(30)))
            .build();
        let classification = ErrorClassification::new(ErrorCategory::TestFailure, Severity::Medium);

        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            orchestrator.handle(failure("slow"), classification, FailureContext::default()),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(orchestrator.active_operations().is_empty());
        assert_eq!(orchestrator.get_statistics().active_operations, 0);

        let config_error = ErrorClassification::new(ErrorCategory::Configuration, Severity::Medium);
        assert_ok!(
            orchestrator
                .handle(failure("next"), config_error, FailureContext::default())
                .await
        );
    }

    #[tokio::test]
    async fn test_escalation_lifecycle_through_orchestrator() {
        let orchestrator = Orchestrator::new(fast_config());
        let classification =
            ErrorClassification::new(ErrorCategory::Authentication, Severity::Critical);

        let result = orchestrator
            .handle(failure("auth"), classification, FailureContext::new("run-9"))
            .await
            .expect("admitted");
        let id = result.escalation.escalation_id.expect("escalation created");

        assert_eq!(orchestrator.get_active_escalations().len(), 1);
        assert_ok!(orchestrator.acknowledge_escalation(id, "oncall"));
        assert_ok!(orchestrator.resolve_escalation(id, "rotated token", "oncall"));
        assert!(orchestrator.get_active_escalations().is_empty());
        assert_err!(orchestrator.close_escalation(id, "duplicate", "oncall"));
        assert!(matches!(
            orchestrator.acknowledge_escalation(Uuid::new_v4(), "oncall"),
            Err(ResilienceError::EscalationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_clears_counters_and_breakers() {
        let orchestrator = Orchestrator::new(fast_config());
        let op: crate::types::SharedOperation = Arc::new(|| async {
            Err::<Value, _>(OperationError::with_code("ECONNREFUSED", "refused"))
        });
        let classification =
            ErrorClassification::new(ErrorCategory::Network, Severity::Medium).retryable(true);

        let result = orchestrator
            .handle(
                failure("fetch").with_operation(op),
                classification,
                FailureContext::new("run-net"),
            )
            .await
            .expect("admitted");
        assert!(!result.success);
        assert_eq!(result.recovery.attempts, 4);

        let stats = orchestrator.get_statistics();
        assert_eq!(stats.retry.sessions, 1);
        assert_eq!(stats.circuit_breakers.len(), 1);
        assert!(stats.adaptive.contains_key("NETWORK"));

        orchestrator.reset();
        let stats = orchestrator.get_statistics();
        assert_eq!(stats.total_operations, 0);
        assert_eq!(stats.retry.sessions, 0);
        assert!(stats.circuit_breakers.is_empty());
        assert!(stats.adaptive.is_empty());
        assert_eq!(stats.recovery.total_attempts, 0);
    }

    #[test]
    fn test_merge_context_keeps_caller_values() {
        let context = FailureContext::new("run-7").with_metadata("last_error", json!("kept"));
        let mut caller = context;
        caller.operation_key = "explicit".to_string();

        let merged = merge_context(caller, failure("from-failure"));
        assert_eq!(merged.operation_id, "run-7");
        assert_eq!(merged.operation_key, "explicit");
        assert_eq!(merged.metadata["last_error"], json!("kept"));

        let merged = merge_context(FailureContext::default(), failure("from-failure"));
        assert_eq!(merged.operation_key, "from-failure");
        assert_eq!(merged.metadata["last_error"], json!("boom"));
    }
}
