//! Pluggable fallback and repair handlers
//!
//! Handlers are keyed by error category. They return `anyhow::Result` so
//! integrators can use whatever error type they like; the recovery manager
//! turns errors and panics into a failed outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{error, warn};

use crate::types::{ErrorCategory, ErrorClassification, FailureContext};

/// What a handler reports back
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub success: bool,
    pub message: String,
    pub data: Map<String, Value>,
}

impl HandlerOutcome {
    pub fn success(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: into_map(data),
        }
    }

    pub fn failure(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: into_map(data),
        }
    }
}

pub(crate) fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn handle(
        &self,
        classification: &ErrorClassification,
        context: &FailureContext,
    ) -> anyhow::Result<HandlerOutcome>;
}

#[async_trait]
impl<F, Fut> RecoveryHandler for F
where
    F: Fn(ErrorClassification, FailureContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send,
{
    async fn handle(
        &self,
        classification: &ErrorClassification,
        context: &FailureContext,
    ) -> anyhow::Result<HandlerOutcome> {
        (self)(classification.clone(), context.clone()).await
    }
}

pub type SharedHandler = Arc<dyn RecoveryHandler>;
pub type HandlerMap = HashMap<ErrorCategory, SharedHandler>;

/// Built-in repair for DEPENDENCY failures: request a dependency install.
///
/// This is the only category with a safe automatic repair.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyInstallHandler;

#[async_trait]
impl RecoveryHandler for DependencyInstallHandler {
    async fn handle(
        &self,
        _classification: &ErrorClassification,
        context: &FailureContext,
    ) -> anyhow::Result<HandlerOutcome> {
        Ok(HandlerOutcome::success(
            "Triggered dependency installation",
            json!({
                "action": "dependency_install",
                "operation_id": context.operation_id,
            }),
        ))
    }
}

/// Human-actionable suggestion for repair categories without a handler
pub fn manual_repair_suggestion(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Syntax => {
            "Fix the syntax error reported in the build log and push a new commit"
        }
        ErrorCategory::Configuration => {
            "Review the pipeline configuration for invalid or missing keys"
        }
        ErrorCategory::Validation => "Correct the input that failed validation and re-run the job",
        ErrorCategory::Dependency => "Install or pin the missing dependency and re-run the job",
        _ => "Inspect the failure logs and apply a manual fix",
    }
}

/// Run a handler on its own task so a panic becomes a failed outcome.
pub(crate) async fn run_isolated(
    handler: SharedHandler,
    classification: &ErrorClassification,
    context: &FailureContext,
) -> HandlerOutcome {
    let classification = classification.clone();
    let context = context.clone();
    let category = classification.category;

    let joined =
        tokio::spawn(async move { handler.handle(&classification, &context).await }).await;

    match joined {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            warn!(category = %category, error = %err, "Recovery handler failed");
            HandlerOutcome::failure(
                format!("Handler for {category} failed: {err:#}"),
                json!({ "error": err.to_string() }),
            )
        }
        Err(join_err) => {
            error!(category = %category, error = %join_err, "Recovery handler panicked");
            HandlerOutcome::failure(
                format!("Handler for {category} panicked"),
                json!({ "error": join_err.to_string() }),
            )
        }
    }
}
