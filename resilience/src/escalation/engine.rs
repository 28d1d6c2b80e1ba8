//! Escalation engine
//!
//! Evaluates triggers for every handled failure, creates escalations with a
//! fixed SLA deadline, dispatches notifications and tracks the escalation
//! lifecycle until it is resolved or closed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::notifier::{Notifier, TracingNotifier};
use super::triggers::{CategoryCounts, TriggerInput, evaluate_triggers, resolve_level};
use super::types::{
    Escalation, EscalationEvaluation, EscalationLevel, EscalationStatus, NotificationRecord,
};
use crate::error::{ResilienceError, Result};
use crate::recovery::RecoveryResult;
use crate::types::{ErrorCategory, ErrorClassification, FailureContext, Severity};

/// Escalation thresholds and dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Failed recoveries per category within the window
    pub recovery_failure_count: u32,
    /// Errors per category within the window
    pub error_frequency: u32,
    pub pattern_recurrence: u32,
    pub severity_threshold: Severity,
    pub resource_utilization_threshold: f64,
    /// Sliding window for frequency and failure counts
    pub window_secs: u64,
    /// When set, CRITICAL plus at least this many triggers becomes EMERGENCY
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_trigger_count: Option<usize>,
    pub channels: Vec<String>,
    pub notification_timeout_ms: u64,
    pub history_limit: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            recovery_failure_count: 5,
            error_frequency: 10,
            pattern_recurrence: 5,
            severity_threshold: Severity::Critical,
            resource_utilization_threshold: 0.9,
            window_secs: 3_600,
            emergency_trigger_count: None,
            channels: vec!["log".to_string()],
            notification_timeout_ms: 5_000,
            history_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EscalationStatistics {
    pub active: usize,
    pub resolved: usize,
    pub closed: usize,
    pub total_created: u64,
    pub sla_breaches: u64,
    pub by_level: BTreeMap<String, u64>,
}

/// Per-category timestamps inside the sliding window
#[derive(Debug, Default)]
struct Tracking {
    errors: HashMap<ErrorCategory, VecDeque<DateTime<Utc>>>,
    recovery_failures: HashMap<ErrorCategory, VecDeque<DateTime<Utc>>>,
}

fn push_windowed(
    table: &mut HashMap<ErrorCategory, VecDeque<DateTime<Utc>>>,
    category: ErrorCategory,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> usize {
    let entries = table.entry(category).or_default();
    while entries.front().is_some_and(|t| now - *t > window) {
        entries.pop_front();
    }
    entries.push_back(now);
    entries.len()
}

pub struct EscalationEngine {
    config: EscalationConfig,
    notifier: Arc<dyn Notifier>,
    active: RwLock<HashMap<Uuid, Escalation>>,
    history: Mutex<VecDeque<Escalation>>,
    tracking: Mutex<Tracking>,
    total_created: AtomicU64,
    sla_breaches: AtomicU64,
    by_level: Mutex<BTreeMap<String, u64>>,
}

impl std::fmt::Debug for EscalationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationEngine")
            .field("config", &self.config)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl Default for EscalationEngine {
    fn default() -> Self {
        Self::new(EscalationConfig::default(), Arc::new(TracingNotifier))
    }
}

impl EscalationEngine {
    pub fn new(config: EscalationConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            notifier,
            active: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            tracking: Mutex::new(Tracking::default()),
            total_created: AtomicU64::new(0),
            sla_breaches: AtomicU64::new(0),
            by_level: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Evaluate a handled failure; creates and dispatches an escalation when
    /// any trigger fires.
    pub async fn evaluate_escalation(
        &self,
        classification: &ErrorClassification,
        recovery: &RecoveryResult,
        context: &FailureContext,
    ) -> EscalationEvaluation {
        let now = Utc::now();
        let counts = self.track(classification.category, !recovery.success, now);
        let category_overdue = self
            .read_active()
            .values()
            .any(|e| e.category == classification.category && e.is_overdue(now));

        let input = TriggerInput {
            classification,
            recovery,
            context,
            counts,
            category_overdue,
            now,
        };
        let triggers = evaluate_triggers(&self.config, &input);
        let level = resolve_level(&triggers, self.config.emergency_trigger_count);

        let Some(sla) = level.sla_duration().filter(|_| !triggers.is_empty()) else {
            debug!(
                category = %classification.category,
                operation_id = %context.operation_id,
                "No escalation triggers fired"
            );
            return EscalationEvaluation {
                required: false,
                level: EscalationLevel::None,
                triggers,
                priority: 0,
                reason: "No escalation triggers fired".to_string(),
                escalation_id: None,
                sla_deadline: None,
            };
        };

        let reason = triggers
            .iter()
            .map(|t| format!("{}: {}", t.kind, t.details))
            .collect::<Vec<_>>()
            .join("; ");

        let mut escalation = Escalation {
            id: Uuid::new_v4(),
            level,
            priority: level.priority(),
            triggers: triggers.clone(),
            status: EscalationStatus::Pending,
            category: classification.category,
            operation_id: context.operation_id.clone(),
            reason: reason.clone(),
            created_at: now,
            sla_deadline: now + sla,
            sla_breached: false,
            acknowledged_at: None,
            acknowledged_by: None,
            in_progress_at: None,
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            notifications: Vec::new(),
            metadata: context.metadata.clone(),
        };

        info!(
            escalation_id = %escalation.id,
            level = %level,
            category = %classification.category,
            triggers = escalation.triggers.len(),
            "Escalation created"
        );

        escalation.notifications = self.dispatch(&escalation).await;

        let evaluation = EscalationEvaluation {
            required: true,
            level,
            triggers,
            priority: escalation.priority,
            reason,
            escalation_id: Some(escalation.id),
            sla_deadline: Some(escalation.sla_deadline),
        };

        self.total_created.fetch_add(1, Ordering::Relaxed);
        *self
            .by_level
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(level.as_str().to_string())
            .or_default() += 1;
        self.write_active().insert(escalation.id, escalation);

        evaluation
    }

    fn track(&self, category: ErrorCategory, failed: bool, now: DateTime<Utc>) -> CategoryCounts {
        let window = i64::try_from(self.config.window_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::weeks(52));
        let mut tracking = self.tracking.lock().unwrap_or_else(PoisonError::into_inner);
        let errors = push_windowed(&mut tracking.errors, category, now, window);
        let recovery_failures = if failed {
            push_windowed(&mut tracking.recovery_failures, category, now, window)
        } else {
            let entries = tracking.recovery_failures.entry(category).or_default();
            while entries.front().is_some_and(|t| now - *t > window) {
                entries.pop_front();
            }
            entries.len()
        };
        CategoryCounts {
            errors,
            recovery_failures,
        }
    }

    async fn dispatch(&self, escalation: &Escalation) -> Vec<NotificationRecord> {
        let timeout = Duration::from_millis(self.config.notification_timeout_ms);
        let mut records = Vec::with_capacity(self.config.channels.len());

        for channel in &self.config.channels {
            let attempted_at = Utc::now();
            let outcome =
                tokio::time::timeout(timeout, self.notifier.notify(escalation, channel)).await;

            let (delivered, error) = match outcome {
                Ok(Ok(delivered)) => (delivered, None),
                Ok(Err(err)) => (false, Some(format!("{err:#}"))),
                Err(_) => (
                    false,
                    Some(format!(
                        "Notification timed out after {}ms",
                        self.config.notification_timeout_ms
                    )),
                ),
            };

            if let Some(error) = &error {
                warn!(
                    escalation_id = %escalation.id,
                    channel = %channel,
                    error = %error,
                    "Escalation notification failed"
                );
            } else {
                debug!(escalation_id = %escalation.id, channel = %channel, delivered, "Notification sent");
            }

            records.push(NotificationRecord {
                channel: channel.clone(),
                delivered,
                error,
                attempted_at,
            });
        }

        records
    }

    pub fn acknowledge_escalation(&self, id: Uuid, who: &str) -> Result<Escalation> {
        self.transition(id, EscalationStatus::Acknowledged, |escalation, now| {
            escalation.acknowledged_at = Some(now);
            escalation.acknowledged_by = Some(who.to_string());
        })
    }

    pub fn mark_in_progress(&self, id: Uuid, who: &str) -> Result<Escalation> {
        self.transition(id, EscalationStatus::InProgress, |escalation, now| {
            escalation.in_progress_at = Some(now);
            if escalation.acknowledged_by.is_none() {
                escalation.acknowledged_at = Some(now);
                escalation.acknowledged_by = Some(who.to_string());
            }
        })
    }

    pub fn resolve_escalation(&self, id: Uuid, resolution: &str, who: &str) -> Result<Escalation> {
        self.transition(id, EscalationStatus::Resolved, |escalation, now| {
            escalation.resolved_at = Some(now);
            escalation.resolved_by = Some(who.to_string());
            escalation.resolution = Some(resolution.to_string());
        })
    }

    pub fn close_escalation(&self, id: Uuid, reason: &str, who: &str) -> Result<Escalation> {
        self.transition(id, EscalationStatus::Closed, |escalation, now| {
            escalation.resolved_at = Some(now);
            escalation.resolved_by = Some(who.to_string());
            escalation.resolution = Some(reason.to_string());
        })
    }

    fn transition(
        &self,
        id: Uuid,
        to: EscalationStatus,
        apply: impl FnOnce(&mut Escalation, DateTime<Utc>),
    ) -> Result<Escalation> {
        let mut active = self.write_active();
        if !active.contains_key(&id) {
            drop(active);
            return Err(match self.find_in_history(id) {
                Some(closed) => ResilienceError::InvalidEscalationTransition {
                    id,
                    from: closed.status,
                    to,
                },
                None => ResilienceError::EscalationNotFound(id),
            });
        }
        let Some(escalation) = active.get_mut(&id) else {
            return Err(ResilienceError::EscalationNotFound(id));
        };

        let from = escalation.status;
        let allowed = match to {
            EscalationStatus::Acknowledged => from == EscalationStatus::Pending,
            EscalationStatus::InProgress => {
                matches!(from, EscalationStatus::Pending | EscalationStatus::Acknowledged)
            }
            EscalationStatus::Resolved | EscalationStatus::Closed => from.is_active(),
            EscalationStatus::Pending => false,
        };
        if !allowed {
            return Err(ResilienceError::InvalidEscalationTransition { id, from, to });
        }

        apply(escalation, Utc::now());
        escalation.status = to;
        info!(escalation_id = %id, from = %from, to = %to, "Escalation status changed");

        if to.is_active() {
            return Ok(escalation.clone());
        }

        let Some(finished) = active.remove(&id) else {
            return Err(ResilienceError::EscalationNotFound(id));
        };
        drop(active);

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = self.config.history_limit.max(1);
        while history.len() >= limit {
            history.pop_front();
        }
        history.push_back(finished.clone());
        Ok(finished)
    }

    /// Flag active escalations whose deadline has passed and return them
    pub fn check_sla_breaches(&self) -> Vec<Escalation> {
        self.check_sla_breaches_at(Utc::now())
    }

    pub fn check_sla_breaches_at(&self, now: DateTime<Utc>) -> Vec<Escalation> {
        let mut active = self.write_active();
        let mut overdue = Vec::new();
        for escalation in active.values_mut().filter(|e| e.is_overdue(now)) {
            if !escalation.sla_breached {
                escalation.sla_breached = true;
                self.sla_breaches.fetch_add(1, Ordering::Relaxed);
                warn!(
                    escalation_id = %escalation.id,
                    level = %escalation.level,
                    deadline = %escalation.sla_deadline,
                    "Escalation SLA breached"
                );
            }
            overdue.push(escalation.clone());
        }
        overdue.sort_by_key(|e| e.sla_deadline);
        overdue
    }

    /// Active escalations, most urgent first
    pub fn get_active_escalations(&self) -> Vec<Escalation> {
        let mut escalations: Vec<_> = self.read_active().values().cloned().collect();
        escalations.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        escalations
    }

    pub fn get_escalation(&self, id: Uuid) -> Option<Escalation> {
        self.read_active()
            .get(&id)
            .cloned()
            .or_else(|| self.find_in_history(id))
    }

    /// Resolved and closed escalations, oldest first
    pub fn history(&self) -> Vec<Escalation> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.read_active().len()
    }

    pub fn statistics(&self) -> EscalationStatistics {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let resolved = history
            .iter()
            .filter(|e| e.status == EscalationStatus::Resolved)
            .count();
        EscalationStatistics {
            active: self.active_count(),
            resolved,
            closed: history.len() - resolved,
            total_created: self.total_created.load(Ordering::Relaxed),
            sla_breaches: self.sla_breaches.load(Ordering::Relaxed),
            by_level: self
                .by_level
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Forget frequency and failure windows
    pub fn reset_tracking(&self) {
        *self.tracking.lock().unwrap_or_else(PoisonError::into_inner) = Tracking::default();
    }

    fn find_in_history(&self, id: Uuid) -> Option<Escalation> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|e| e.id == id)
            .cloned()
    }

    fn read_active(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Escalation>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Escalation>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }
}
