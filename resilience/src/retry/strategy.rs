//! Backoff strategy implementations
//!
//! Delays are computed from a 0-indexed attempt number and always capped at
//! `max_delay_ms`. Jitter is applied before the cap and floored at zero.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::adaptive::{AdaptiveConfig, CategoryMetrics};

/// Backoff policy between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffStrategy {
    FixedDelay,
    LinearBackoff,
    #[default]
    ExponentialBackoff,
    ExponentialBackoffWithJitter,
    Adaptive,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedDelay => "FIXED_DELAY",
            Self::LinearBackoff => "LINEAR_BACKOFF",
            Self::ExponentialBackoff => "EXPONENTIAL_BACKOFF",
            Self::ExponentialBackoffWithJitter => "EXPONENTIAL_BACKOFF_WITH_JITTER",
            Self::Adaptive => "ADAPTIVE",
        }
    }
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (total invocations = max_retries + 1)
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    pub strategy: BackoffStrategy,
    pub jitter_factor: f64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            timeout_ms: 30_000,
            strategy: BackoffStrategy::ExponentialBackoff,
            jitter_factor: 0.1,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Delay before the retry that follows the 0-indexed `attempt`.
///
/// `history` is only consulted by the adaptive strategy; with fewer than
/// `adaptive.min_samples` samples it degrades to plain exponential backoff.
pub fn compute_delay(
    config: &RetryConfig,
    attempt: u32,
    history: Option<&CategoryMetrics>,
    adaptive: &AdaptiveConfig,
) -> Duration {
    let base = config.base_delay_ms as f64;
    let exponent = attempt.min(i32::MAX as u32) as i32;

    let raw = match config.strategy {
        BackoffStrategy::FixedDelay => base,
        BackoffStrategy::LinearBackoff => base * (f64::from(attempt) + 1.0),
        BackoffStrategy::ExponentialBackoff => base * config.multiplier.powi(exponent),
        BackoffStrategy::ExponentialBackoffWithJitter => apply_jitter(
            base * config.multiplier.powi(exponent),
            config.jitter_factor,
        ),
        BackoffStrategy::Adaptive => match history {
            Some(metrics) if metrics.samples >= adaptive.min_samples => {
                let multiplier = adaptive_multiplier(config.multiplier, metrics, adaptive);
                apply_jitter(base * multiplier.powi(exponent), config.jitter_factor)
            }
            _ => base * config.multiplier.powi(exponent),
        },
    };

    let capped = raw.min(config.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped.round() as u64)
}

fn adaptive_multiplier(base: f64, metrics: &CategoryMetrics, adaptive: &AdaptiveConfig) -> f64 {
    let mut multiplier = base;
    if metrics.success_rate < adaptive.low_success_rate {
        multiplier *= 1.5;
    } else if metrics.success_rate > adaptive.high_success_rate {
        multiplier *= 0.8;
    }
    if metrics.average_duration_ms > adaptive.slow_duration_ms {
        multiplier *= 1.2;
    }
    multiplier
}

/// Apply uniform jitter in `±jitter_factor` to a delay in milliseconds.
///
/// Example: 1000ms with 0.1 jitter → 900ms to 1100ms. Never negative.
pub(crate) fn apply_jitter(delay_ms: f64, jitter_factor: f64) -> f64 {
    if jitter_factor <= 0.0 || delay_ms <= 0.0 {
        return delay_ms.max(0.0);
    }
    let jitter = rand::rng().random_range(-jitter_factor..=jitter_factor);
    (delay_ms * (1.0 + jitter)).max(0.0)
}

/// Wait with cancellation support. `Err` means the token fired first.
pub(crate) async fn wait_with_cancel(
    cancel: &CancellationToken,
    duration: Duration,
) -> Result<(), ()> {
    if duration.is_zero() {
        return if cancel.is_cancelled() { Err(()) } else { Ok(()) };
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config(strategy: BackoffStrategy) -> RetryConfig {
        RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            ..Default::default()
        }
        .with_strategy(strategy)
    }

    fn delay_ms(config: &RetryConfig, attempt: u32, history: Option<&CategoryMetrics>) -> u64 {
        compute_delay(config, attempt, history, &AdaptiveConfig::default()).as_millis() as u64
    }

    fn history(success_rate: f64, average_duration_ms: f64, samples: u64) -> CategoryMetrics {
        CategoryMetrics {
            success_rate,
            average_duration_ms,
            samples,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_backoff_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1_000);
        assert_eq!(config.max_delay_ms, 30_000);
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.jitter_factor, 0.1);
        assert_eq!(config.strategy, BackoffStrategy::ExponentialBackoff);
    }

    #[test]
    fn test_fixed_and_linear() {
        let fixed = config(BackoffStrategy::FixedDelay);
        assert_eq!(delay_ms(&fixed, 0, None), 100);
        assert_eq!(delay_ms(&fixed, 5, None), 100);

        let linear = config(BackoffStrategy::LinearBackoff);
        assert_eq!(delay_ms(&linear, 0, None), 100);
        assert_eq!(delay_ms(&linear, 2, None), 300);
    }

    #[test]
    fn test_exponential_sequence_and_cap() {
        let exp = config(BackoffStrategy::ExponentialBackoff);
        let delays: Vec<u64> = (0..10).map(|n| delay_ms(&exp, n, None)).collect();
        assert_eq!(&delays[..4], &[100, 200, 400, 800]);
        assert_eq!(delays[9], 10_000);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_huge_attempt_saturates_at_cap() {
        let exp = config(BackoffStrategy::ExponentialBackoff);
        assert_eq!(delay_ms(&exp, u32::MAX, None), 10_000);
    }

    #[test]
    fn test_jitter_range() {
        for _ in 0..100 {
            let jittered = apply_jitter(1000.0, 0.5);
            assert!(
                (500.0..=1500.0).contains(&jittered),
                "Jittered value {jittered} out of range [500, 1500]"
            );
        }
        assert_eq!(apply_jitter(0.0, 0.5), 0.0);
    }

    #[test]
    fn test_adaptive_falls_back_below_min_samples() {
        let adaptive = config(BackoffStrategy::Adaptive);
        let sparse = history(0.1, 50_000.0, 3);
        assert_eq!(delay_ms(&adaptive, 2, Some(&sparse)), 400);
        assert_eq!(delay_ms(&adaptive, 2, None), 400);
    }

    #[test]
    fn test_adaptive_multiplier_adjustments() {
        let metrics_cfg = AdaptiveConfig::default();
        let struggling = history(0.3, 100.0, 20);
        assert!((adaptive_multiplier(2.0, &struggling, &metrics_cfg) - 3.0).abs() < 1e-9);

        let healthy = history(0.95, 100.0, 20);
        assert!((adaptive_multiplier(2.0, &healthy, &metrics_cfg) - 1.6).abs() < 1e-9);

        let slow = history(0.3, 20_000.0, 20);
        assert!((adaptive_multiplier(2.0, &slow, &metrics_cfg) - 3.6).abs() < 1e-9);

        let middling = history(0.6, 100.0, 20);
        assert!((adaptive_multiplier(2.0, &middling, &metrics_cfg) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_adaptive_delay_within_jitter_of_adjusted() {
        let adaptive = config(BackoffStrategy::Adaptive);
        let struggling = history(0.3, 100.0, 20);
        // 100 * 3^2 = 900 ± 10%
        for _ in 0..50 {
            let delay = delay_ms(&adaptive, 2, Some(&struggling));
            assert!((810..=990).contains(&delay), "delay {delay} out of range");
        }
    }

    #[tokio::test]
    async fn test_wait_with_cancel() {
        let cancel = CancellationToken::new();
        assert!(wait_with_cancel(&cancel, Duration::from_millis(1)).await.is_ok());
        cancel.cancel();
        assert!(wait_with_cancel(&cancel, Duration::from_secs(60)).await.is_err());
        assert!(wait_with_cancel(&cancel, Duration::ZERO).await.is_err());
    }
}
