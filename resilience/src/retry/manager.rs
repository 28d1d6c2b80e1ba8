//! Retry execution gated by circuit breakers
//!
//! [`RetryStrategyManager::execute_with_retry`] runs an operation up to
//! `max_retries + 1` times. Each attempt races the per-attempt timeout and the
//! caller's cancellation token, every attempt is recorded on the session, and
//! the session outcome is folded into the adaptive metrics exactly once.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::adaptive::{AdaptiveConfig, AdaptiveMetrics};
use super::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use super::classifier::{OperationError, RetryClassifiable};
use super::strategy::{BackoffStrategy, RetryConfig, compute_delay, wait_with_cancel};
use super::{Result, RetryError};
use crate::types::ErrorCategory;

/// Retry session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Retrying,
    Waiting,
    Exhausted,
    Succeeded,
    Failed,
}

/// One invocation of the operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    /// 1-indexed
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error_code: Option<String>,
    /// Backoff slept after this attempt, if any
    pub delay_ms: Option<u64>,
}

/// State of a single `execute_with_retry` call
#[derive(Debug, Clone, Serialize)]
pub struct RetrySession {
    pub id: Uuid,
    pub operation_key: String,
    pub category: ErrorCategory,
    pub strategy: BackoffStrategy,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempts: Vec<Attempt>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

impl RetrySession {
    fn new(config: &RetryConfig, ctx: &RetryContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_key: ctx.operation_key.clone(),
            category: ctx.category,
            strategy: config.strategy,
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            attempts: Vec::new(),
            state: SessionState::Idle,
            started_at: Utc::now(),
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// Who is being retried and how to stop it
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Selects the circuit breaker
    pub operation_key: String,
    /// Selects the adaptive metrics row
    pub category: ErrorCategory,
    pub cancel: CancellationToken,
}

impl RetryContext {
    pub fn new(operation_key: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            operation_key: operation_key.into(),
            category,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Successful result together with the session that produced it
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    pub session: RetrySession,
}

/// Why a session stopped without a value
enum Stop {
    Aborted,
    CircuitOpen,
    Permanent(OperationError),
    Exhausted(OperationError),
}

impl Stop {
    fn into_error(self, session: RetrySession) -> RetryError {
        let attempts = session.attempts;
        match self {
            Self::Aborted => RetryError::Aborted { attempts },
            Self::CircuitOpen => RetryError::CircuitOpen {
                operation_key: session.operation_key,
                attempts,
            },
            Self::Permanent(error) => RetryError::Permanent { error, attempts },
            Self::Exhausted(last_error) => RetryError::Exhausted {
                last_error,
                attempts,
            },
        }
    }
}

/// Aggregate counters across all sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStatistics {
    pub sessions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_attempts: u64,
    pub circuit_rejections: u64,
}

#[derive(Debug, Default)]
struct RetryCounters {
    sessions: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    total_attempts: AtomicU64,
    circuit_rejections: AtomicU64,
}

impl RetryCounters {
    fn snapshot(&self) -> RetryStatistics {
        RetryStatistics {
            sessions: self.sessions.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.sessions,
            &self.succeeded,
            &self.failed,
            &self.total_attempts,
            &self.circuit_rejections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Runs operations with backoff, breakers and adaptive metrics
#[derive(Debug)]
pub struct RetryStrategyManager {
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: AdaptiveMetrics,
    counters: RetryCounters,
}

impl Default for RetryStrategyManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), AdaptiveConfig::default())
    }
}

impl RetryStrategyManager {
    pub fn new(breaker_config: CircuitBreakerConfig, adaptive_config: AdaptiveConfig) -> Self {
        Self::with_registry(
            Arc::new(CircuitBreakerRegistry::new(breaker_config)),
            adaptive_config,
        )
    }

    /// Share an existing breaker registry
    pub fn with_registry(
        breakers: Arc<CircuitBreakerRegistry>,
        adaptive_config: AdaptiveConfig,
    ) -> Self {
        Self {
            breakers,
            metrics: AdaptiveMetrics::new(adaptive_config),
            counters: RetryCounters::default(),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn metrics(&self) -> &AdaptiveMetrics {
        &self.metrics
    }

    pub fn statistics(&self) -> RetryStatistics {
        self.counters.snapshot()
    }

    /// Clear adaptive history, breakers and counters
    pub fn reset(&self) {
        self.metrics.reset();
        self.breakers.reset_all();
        self.counters.reset();
    }

    /// Execute `operation` under `config`, gated by the breaker for
    /// `ctx.operation_key`.
    ///
    /// Returns `CircuitOpen` without invoking the operation when the breaker
    /// rejects the call, `Permanent` on a non-retryable code, `Exhausted`
    /// after `max_retries + 1` failed invocations and `Aborted` when the
    /// cancellation token fires.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        mut operation: F,
        config: &RetryConfig,
        ctx: &RetryContext,
    ) -> Result<Retried<T>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, OperationError>> + Send,
        T: Send,
    {
        let breaker = self.breakers.get_or_create(&ctx.operation_key);
        let attempt_timeout = Duration::from_millis(config.timeout_ms);
        let clock = Instant::now();
        let mut session = RetrySession::new(config, ctx);
        let mut attempt: u32 = 0;

        let outcome = loop {
            if ctx.cancel.is_cancelled() {
                break Err(Stop::Aborted);
            }

            if breaker.is_open() {
                self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(operation_key = %ctx.operation_key, "Attempt rejected by open circuit");
                break Err(Stop::CircuitOpen);
            }

            session.state = SessionState::Retrying;
            let started_at = Utc::now();
            let attempt_clock = Instant::now();

            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                result = tokio::time::timeout(attempt_timeout, operation()) => Some(
                    result.unwrap_or_else(|_| Err(OperationError::timeout(config.timeout_ms)))
                ),
            };

            let Some(result) = result else {
                break Err(Stop::Aborted);
            };

            let number = attempt + 1;
            let duration_ms = attempt_clock.elapsed().as_millis() as u64;
            self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);

            match result {
                Ok(value) => {
                    breaker.record_success();
                    session.attempts.push(Attempt {
                        number,
                        started_at,
                        duration_ms,
                        success: true,
                        error_code: None,
                        delay_ms: None,
                    });
                    debug!(operation_key = %ctx.operation_key, attempt = number, "Attempt succeeded");
                    break Ok(value);
                }
                Err(err) => {
                    breaker.record_failure();
                    let mut record = Attempt {
                        number,
                        started_at,
                        duration_ms,
                        success: false,
                        error_code: err.code.clone(),
                        delay_ms: None,
                    };

                    if !err.is_retryable() {
                        session.attempts.push(record);
                        break Err(Stop::Permanent(err));
                    }

                    if breaker.is_open() {
                        session.attempts.push(record);
                        self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            operation_key = %ctx.operation_key,
                            attempts = number,
                            "Circuit opened mid-session"
                        );
                        break Err(Stop::CircuitOpen);
                    }

                    if attempt >= config.max_retries {
                        session.attempts.push(record);
                        break Err(Stop::Exhausted(err));
                    }

                    let history = self.metrics.get(ctx.category);
                    let mut delay =
                        compute_delay(config, attempt, history.as_ref(), self.metrics.config());
                    if let Some(suggested) = err.suggested_backoff() {
                        delay = delay
                            .max(suggested)
                            .min(Duration::from_millis(config.max_delay_ms));
                    }
                    record.delay_ms = Some(delay.as_millis() as u64);
                    session.attempts.push(record);

                    debug!(
                        operation_key = %ctx.operation_key,
                        category = %ctx.category,
                        attempt = number,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );

                    session.state = SessionState::Waiting;
                    if wait_with_cancel(&ctx.cancel, delay).await.is_err() {
                        break Err(Stop::Aborted);
                    }
                    attempt += 1;
                }
            }
        };

        session.state = match &outcome {
            Ok(_) => SessionState::Succeeded,
            Err(Stop::Exhausted(_)) => SessionState::Exhausted,
            Err(_) => SessionState::Failed,
        };
        self.complete(&session, clock.elapsed());

        match outcome {
            Ok(value) => Ok(Retried { value, session }),
            Err(stop) => Err(stop.into_error(session)),
        }
    }

    fn complete(&self, session: &RetrySession, elapsed: Duration) {
        let success = session.state == SessionState::Succeeded;
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);
        if success {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics
            .record(session.category, success, elapsed.as_millis() as f64);

        match session.state {
            SessionState::Succeeded => info!(
                operation_key = %session.operation_key,
                attempts = session.attempts.len(),
                "Retry session succeeded"
            ),
            state => warn!(
                operation_key = %session.operation_key,
                attempts = session.attempts.len(),
                state = ?state,
                "Retry session did not succeed"
            ),
        }
    }
}
