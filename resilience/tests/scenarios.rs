//! End-to-end scenarios through the orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ci_resilience::config::ResilienceConfig;
use ci_resilience::recovery::{HandlerOutcome, RecoveryStrategy, SharedHandler};
use ci_resilience::retry::BackoffStrategy;
use ci_resilience::{
    ErrorCategory, ErrorClassification, Escalation, EscalationLevel, FailedOperation,
    FailureContext, Notifier, OperationError, Orchestrator, ResilienceError, Severity,
    SharedOperation,
};
use serde_json::json;

#[derive(Default)]
struct RecordingNotifier {
    channels: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _escalation: &Escalation, channel: &str) -> anyhow::Result<bool> {
        self.channels
            .lock()
            .expect("notifier lock")
            .push(channel.to_string());
        Ok(true)
    }
}

#[tokio::test]
async fn flaky_network_recovers_by_retry() {
    let mut config = ResilienceConfig::default();
    config.retry.max_retries = 3;
    config.retry.base_delay_ms = 100;
    config.retry.strategy = BackoffStrategy::ExponentialBackoff;

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let operation: SharedOperation = Arc::new(move || {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OperationError::with_code("ECONNREFUSED", "connection refused"))
            } else {
                Ok(json!({ "downloaded": true }))
            }
        }
    });

    let orchestrator = Orchestrator::new(config);
    let result = orchestrator
        .handle(
            FailedOperation::new(
                "artifact-registry",
                OperationError::with_code("ECONNREFUSED", "connection refused"),
            )
            .with_operation(operation),
            ErrorClassification::new(ErrorCategory::Network, Severity::Medium).retryable(true),
            FailureContext::new("pipeline-17"),
        )
        .await
        .expect("admitted");

    assert!(result.success);
    assert_eq!(
        result.recovery.strategy,
        RecoveryStrategy::Retry(BackoffStrategy::ExponentialBackoff)
    );
    assert_eq!(result.recovery.attempts, 3);
    assert_eq!(result.recovery.action(), Some("retried"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!result.escalation.required);
    assert!(orchestrator.get_active_escalations().is_empty());

    let stats = orchestrator.get_statistics();
    assert_eq!(stats.retry.succeeded, 1);
    assert_eq!(stats.retry.total_attempts, 3);
}

#[tokio::test]
async fn critical_auth_failure_escalates_without_retry() {
    let mut config = ResilienceConfig::default();
    config.escalation.channels = vec!["slack".to_string(), "pagerduty".to_string()];
    let notifier = Arc::new(RecordingNotifier::default());

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let operation: SharedOperation = Arc::new(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OperationError>(json!({}))
        }
    });

    let orchestrator = Orchestrator::builder(config)
        .notifier(notifier.clone())
        .build();
    let result = orchestrator
        .handle(
            FailedOperation::new(
                "deploy:production",
                OperationError::with_code("AUTHENTICATION_FAILED", "token rejected"),
            )
            .with_operation(operation),
            ErrorClassification::new(ErrorCategory::Authentication, Severity::Critical),
            FailureContext::new("release-3"),
        )
        .await
        .expect("admitted");

    assert!(!result.success);
    assert!(result.recovery.strategy.is_escalation());
    assert_eq!(result.recovery.action(), Some("escalated"));
    assert_eq!(result.recovery.attempts, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(result.escalation.required);
    assert_eq!(result.escalation.level, EscalationLevel::Critical);
    let id = result.escalation.escalation_id.expect("escalation created");
    let escalation = orchestrator
        .get_active_escalations()
        .into_iter()
        .find(|e| e.id == id)
        .expect("active escalation");
    assert_eq!(
        escalation.sla_deadline,
        escalation.created_at + chrono::Duration::minutes(30)
    );
    assert_eq!(escalation.delivered_count(), 2);
    assert_eq!(
        *notifier.channels.lock().expect("notifier lock"),
        vec!["slack".to_string(), "pagerduty".to_string()]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn concurrency_ceiling_rejects_overflow() {
    let mut config = ResilienceConfig::default();
    config.orchestrator.max_concurrent_operations = 10;

    let fallback: SharedHandler =
        Arc::new(|_c: ErrorClassification, _ctx: FailureContext| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, anyhow::Error>(HandlerOutcome::success(
                "Re-ran suite on a clean runner",
                json!({ "action": "rerun" }),
            ))
        });
    let orchestrator = Arc::new(
        Orchestrator::builder(config)
            .fallback_handler(ErrorCategory::TestFailure, fallback)
            .build(),
    );

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .handle(
                        FailedOperation::new(
                            format!("suite-{i}"),
                            OperationError::new("2 tests failed"),
                        ),
                        ErrorClassification::new(ErrorCategory::TestFailure, Severity::Medium),
                        FailureContext::new(format!("run-{i}")),
                    )
                    .await
            })
        })
        .collect();

    let mut rejected = 0;
    let mut handled = 0;
    for handle in handles {
        match handle.await.expect("task joined") {
            Ok(result) => {
                assert!(result.success);
                handled += 1;
            }
            Err(ResilienceError::CapacityExceeded { limit, .. }) => {
                assert_eq!(limit, 10);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(rejected, 2);
    assert_eq!(handled, 10);

    let stats = orchestrator.get_statistics();
    assert_eq!(stats.rejected_operations, 2);
    assert_eq!(stats.successful_operations, 10);
    assert_eq!(stats.active_operations, 0);
    assert!(orchestrator.active_operations().is_empty());
}

#[tokio::test]
async fn missing_dependency_is_repaired() {
    let orchestrator = Orchestrator::new(ResilienceConfig::default());

    let result = orchestrator
        .handle(
            FailedOperation::new("build:install", OperationError::new("Cannot find module 'x'")),
            ErrorClassification::new(ErrorCategory::Dependency, Severity::Medium),
            FailureContext::new("build-5"),
        )
        .await
        .expect("admitted");

    assert!(result.success);
    assert_eq!(result.recovery.strategy, RecoveryStrategy::Repair);
    assert_eq!(result.recovery.action(), Some("dependency_install"));
    assert!(result.recovery.checkpoint_id.is_some());
    assert!(result.into_result().is_ok());
}
