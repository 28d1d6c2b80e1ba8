//! Escalation data model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::{ErrorCategory, Severity};

/// Escalation level, ordered `None < Low < ... < Emergency`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
    Emergency,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
            Self::Emergency => "EMERGENCY",
        }
    }

    /// Minutes until the SLA deadline; `None` carries no deadline
    pub fn sla_minutes(&self) -> Option<i64> {
        match self {
            Self::Emergency => Some(15),
            Self::Critical => Some(30),
            Self::High => Some(60),
            Self::Medium => Some(240),
            Self::Low => Some(480),
            Self::None => None,
        }
    }

    pub fn sla_duration(&self) -> Option<Duration> {
        self.sla_minutes().map(Duration::minutes)
    }

    /// 1 is the most urgent; 0 means no escalation
    pub fn priority(&self) -> u8 {
        match self {
            Self::Emergency => 1,
            Self::Critical => 2,
            Self::High => 3,
            Self::Medium => 4,
            Self::Low => 5,
            Self::None => 0,
        }
    }

    pub fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Low => Self::Low,
            Severity::Medium => Self::Medium,
            Severity::High => Self::High,
            Severity::Critical => Self::Critical,
        }
    }
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStatus {
    Pending,
    Acknowledged,
    InProgress,
    Resolved,
    Closed,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::InProgress => "IN_PROGRESS",
            Self::Resolved => "RESOLVED",
            Self::Closed => "CLOSED",
        }
    }

    /// Still in the active map
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Acknowledged | Self::InProgress)
    }
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    ErrorSeverity,
    RecoveryFailure,
    ErrorFrequency,
    PatternDetection,
    SlaBreach,
    ResourceExhaustion,
    ManualRequest,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorSeverity => "ERROR_SEVERITY",
            Self::RecoveryFailure => "RECOVERY_FAILURE",
            Self::ErrorFrequency => "ERROR_FREQUENCY",
            Self::PatternDetection => "PATTERN_DETECTION",
            Self::SlaBreach => "SLA_BREACH",
            Self::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            Self::ManualRequest => "MANUAL_REQUEST",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fired trigger and the level it asks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub level: EscalationLevel,
    pub confidence: f64,
    pub details: String,
}

/// Outcome of one notifier call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub channel: String,
    pub delivered: bool,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub level: EscalationLevel,
    pub priority: u8,
    pub triggers: Vec<Trigger>,
    pub status: EscalationStatus,
    pub category: ErrorCategory,
    pub operation_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// Fixed at creation from the level
    pub sla_deadline: DateTime<Utc>,
    #[serde(default)]
    pub sla_breached: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub in_progress_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution: Option<String>,
    #[serde(default)]
    pub notifications: Vec<NotificationRecord>,
    /// Context metadata, handed back unchanged
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Escalation {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && now > self.sla_deadline
    }

    pub fn delivered_count(&self) -> usize {
        self.notifications.iter().filter(|n| n.delivered).count()
    }
}

/// Result of evaluating one failure for escalation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationEvaluation {
    pub required: bool,
    pub level: EscalationLevel,
    pub triggers: Vec<Trigger>,
    pub priority: u8,
    pub reason: String,
    pub escalation_id: Option<Uuid>,
    pub sla_deadline: Option<DateTime<Utc>>,
}
