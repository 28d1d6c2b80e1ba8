//! Notification dispatch for new escalations
//!
//! Delivery itself (email, chat, paging) lives outside this crate. The engine
//! calls the notifier once per configured channel; failures are logged and
//! recorded on the escalation but never fail the evaluation.

use async_trait::async_trait;
use tracing::{info, warn};

use super::types::{Escalation, EscalationLevel};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `escalation` on `channel`. `Ok(false)` means "not delivered"
    /// without an error (channel muted, rate limited).
    async fn notify(&self, escalation: &Escalation, channel: &str) -> anyhow::Result<bool>;
}

/// Logs each escalation through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, escalation: &Escalation, channel: &str) -> anyhow::Result<bool> {
        if escalation.level >= EscalationLevel::Critical {
            warn!(
                escalation_id = %escalation.id,
                level = %escalation.level,
                channel,
                deadline = %escalation.sla_deadline,
                reason = %escalation.reason,
                "Escalation raised"
            );
        } else {
            info!(
                escalation_id = %escalation.id,
                level = %escalation.level,
                channel,
                deadline = %escalation.sla_deadline,
                reason = %escalation.reason,
                "Escalation raised"
            );
        }
        Ok(true)
    }
}
