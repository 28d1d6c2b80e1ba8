//! `resilience-drill` entry point.
//!
//! Runs three built-in failure scenarios through the orchestrator and prints
//! the resulting statistics as JSON:
//!
//! - flaky network call recovered by retry
//! - critical authentication failure escalated
//! - missing dependency repaired by the built-in install handler
//!
//! Usage: `resilience-drill [--config PATH]`

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use ci_resilience::config::ConfigLoader;
use ci_resilience::{
    ErrorCategory, ErrorClassification, FailedOperation, FailureContext, OperationError,
    Orchestrator, Severity, SharedOperation,
};
use serde_json::{Value, json};

fn config_path() -> anyhow::Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--config") => args
            .next()
            .map(|p| Some(PathBuf::from(p)))
            .context("--config requires a path"),
        Some(other) => {
            anyhow::bail!("unknown argument: {other} (usage: resilience-drill [--config PATH])")
        }
    }
}

/// Fails with ECONNREFUSED `failures` times, then succeeds
fn flaky_operation(failures: u32) -> SharedOperation {
    let calls = Arc::new(AtomicU32::new(0));
    Arc::new(move || {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(OperationError::with_code("ECONNREFUSED", "connection refused"))
            } else {
                Ok(json!({ "status": 200, "call": n }))
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config_path()? {
        Some(path) => ConfigLoader::new().with_file(path).load()?,
        None => ConfigLoader::load_default()?,
    };
    tracing::info!("resilience-drill v{} starting", ci_resilience::VERSION);

    let orchestrator = Orchestrator::new(config);

    let network = orchestrator
        .handle(
            FailedOperation::new(
                "artifact-registry:fetch",
                OperationError::with_code("ECONNREFUSED", "connection refused"),
            )
            .with_operation(flaky_operation(2)),
            ErrorClassification::new(ErrorCategory::Network, Severity::Medium).retryable(true),
            FailureContext::new("drill-network"),
        )
        .await?;

    let auth = orchestrator
        .handle(
            FailedOperation::new(
                "deploy:production",
                OperationError::with_code("AUTHENTICATION_FAILED", "token rejected"),
            ),
            ErrorClassification::new(ErrorCategory::Authentication, Severity::Critical)
                .with_confidence(0.95),
            FailureContext::new("drill-auth").with_metadata("pipeline", json!("release")),
        )
        .await?;

    let dependency = orchestrator
        .handle(
            FailedOperation::new(
                "build:install",
                OperationError::new("Cannot find module 'left-pad'"),
            ),
            ErrorClassification::new(ErrorCategory::Dependency, Severity::Medium),
            FailureContext::new("drill-dependency"),
        )
        .await?;

    let report: Value = json!({
        "scenarios": {
            "flaky_network": network,
            "critical_auth": auth,
            "dependency_repair": dependency,
        },
        "statistics": orchestrator.get_statistics(),
        "active_escalations": orchestrator.get_active_escalations(),
    });

    #[allow(clippy::print_stdout)]
    {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}
