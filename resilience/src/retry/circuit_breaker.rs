//! Circuit breaker for cascading failure prevention
//!
//! One breaker per operation key, three states:
//! - `Closed`: failures accumulate; reaching the threshold opens the circuit.
//!   A success decrements the failure counter (floor 0).
//! - `Open`: calls are rejected until the cooldown elapses. The transition to
//!   `HalfOpen` happens lazily inside [`CircuitBreaker::is_open`], no timer.
//! - `HalfOpen`: consecutive successes close the circuit, any failure reopens it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,   // Normal operation
    Open,     // Failure threshold exceeded, fast-fail
    HalfOpen, // Testing if service recovered
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures in CLOSED before the circuit opens
    pub failure_threshold: u32,
    /// Cooldown before an OPEN circuit admits a probe
    pub timeout_ms: u64,
    /// Consecutive HALF_OPEN successes required to close
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 60_000,
            half_open_success_threshold: 3,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub operation_key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub total_failures: u64,
    pub total_successes: u64,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    total_failures: u64,
    total_successes: u64,
}

/// Circuit breaker for a single operation key
#[derive(Debug)]
pub struct CircuitBreaker {
    operation_key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(operation_key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            operation_key: operation_key.into(),
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    pub fn operation_key(&self) -> &str {
        &self.operation_key
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether calls should be rejected right now.
    ///
    /// An OPEN breaker whose cooldown has elapsed moves to HALF_OPEN here and
    /// reports `false` so the next call acts as a probe.
    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    fn is_open_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return false;
        }

        let cooldown = Duration::from_millis(self.config.timeout_ms);
        let cooled_down = inner
            .last_failure
            .is_none_or(|failed_at| now.saturating_duration_since(failed_at) > cooldown);
        if cooled_down {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            info!(operation_key = %self.operation_key, "Circuit breaker half-open");
            return false;
        }
        true
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    info!(operation_key = %self.operation_key, "Circuit breaker closed");
                }
            }
            // Nothing passes the gate while open
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_time = Some(Utc::now());
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        operation_key = %self.operation_key,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                warn!(operation_key = %self.operation_key, "Circuit breaker reopened from half-open");
            }
            CircuitState::Open => {}
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock();
        CircuitBreakerStats {
            operation_key: self.operation_key.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            last_failure_time: inner.last_failure_time,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }

    pub fn reset(&self) {
        *self.lock() = BreakerState::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide table of breakers, one per operation key
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn get(&self, operation_key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation_key)
            .cloned()
    }

    /// Breaker for `operation_key`, created on first use
    pub fn get_or_create(&self, operation_key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(operation_key) {
            return breaker;
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(operation_key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(operation_key, self.config.clone())))
            .clone()
    }

    /// Snapshots of every breaker, ordered by key
    pub fn snapshots(&self) -> Vec<CircuitBreakerStats> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<_> = breakers.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.operation_key.cmp(&b.operation_key));
        stats
    }

    /// Reset a single breaker; returns false for unknown keys
    pub fn reset(&self, operation_key: &str) -> bool {
        match self.get(operation_key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
