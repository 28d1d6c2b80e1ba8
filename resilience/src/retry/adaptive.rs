//! Per-category outcome history for the adaptive backoff strategy
//!
//! Each category keeps exponential moving averages of session success rate and
//! duration. The table is updated once per completed retry session, under the
//! write lock, so concurrent sessions never lose an update.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ErrorCategory;

/// Adaptive strategy tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// EMA learning rate
    pub learning_rate: f64,
    /// Samples required before history influences the delay
    pub min_samples: u64,
    /// Below this success rate the multiplier grows by 1.5
    pub low_success_rate: f64,
    /// Above this success rate the multiplier shrinks by 0.8
    pub high_success_rate: f64,
    /// Average session duration above which the multiplier grows by 1.2
    pub slow_duration_ms: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            min_samples: 10,
            low_success_rate: 0.5,
            high_success_rate: 0.8,
            slow_duration_ms: 10_000.0,
        }
    }
}

/// Moving averages for one error category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryMetrics {
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub samples: u64,
    pub updated_at: DateTime<Utc>,
}

impl CategoryMetrics {
    fn first(success: bool, duration_ms: f64) -> Self {
        Self {
            success_rate: if success { 1.0 } else { 0.0 },
            average_duration_ms: duration_ms,
            samples: 1,
            updated_at: Utc::now(),
        }
    }

    fn update(&mut self, success: bool, duration_ms: f64, alpha: f64) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = alpha * outcome + (1.0 - alpha) * self.success_rate;
        self.average_duration_ms = alpha * duration_ms + (1.0 - alpha) * self.average_duration_ms;
        self.samples += 1;
        self.updated_at = Utc::now();
    }
}

/// Shared adaptive metrics table
#[derive(Debug, Default)]
pub struct AdaptiveMetrics {
    config: AdaptiveConfig,
    table: RwLock<HashMap<ErrorCategory, CategoryMetrics>>,
}

impl AdaptiveMetrics {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Fold one completed session into the category's averages
    pub fn record(&self, category: ErrorCategory, success: bool, duration_ms: f64) {
        let alpha = self.config.learning_rate;
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table
            .entry(category)
            .and_modify(|metrics| metrics.update(success, duration_ms, alpha))
            .or_insert_with(|| CategoryMetrics::first(success, duration_ms));
    }

    pub fn get(&self, category: ErrorCategory) -> Option<CategoryMetrics> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .cloned()
    }

    /// All categories keyed by canonical name
    pub fn snapshot(&self) -> BTreeMap<String, CategoryMetrics> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(category, metrics)| (category.as_str().to_string(), metrics.clone()))
            .collect()
    }

    pub fn reset(&self) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
