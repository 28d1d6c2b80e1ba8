//! Bounded checkpoint store
//!
//! Checkpoints capture an operation's state before a mutating recovery action
//! so a later ROLLBACK can restore it. Retention is bounded; the oldest
//! checkpoint is evicted on insert once the store is full.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_CHECKPOINT_RETENTION: usize = 50;

/// Snapshot of an operation's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub operation_id: String,
    pub captured_state: Value,
    /// Context metadata, handed back unchanged
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CheckpointStore {
    capacity: usize,
    checkpoints: Mutex<VecDeque<Checkpoint>>,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_RETENTION)
    }
}

impl CheckpointStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            checkpoints: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn create(
        &self,
        operation_id: &str,
        captured_state: Value,
        metadata: Map<String, Value>,
    ) -> Checkpoint {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            operation_id: operation_id.to_string(),
            captured_state,
            metadata,
            timestamp: Utc::now(),
        };

        let mut checkpoints = self.lock();
        while checkpoints.len() >= self.capacity {
            if let Some(evicted) = checkpoints.pop_front() {
                debug!(checkpoint_id = %evicted.id, "Evicted oldest checkpoint");
            }
        }
        checkpoints.push_back(checkpoint.clone());
        debug!(
            checkpoint_id = %checkpoint.id,
            operation_id,
            "Checkpoint created"
        );
        checkpoint
    }

    pub fn get(&self, id: Uuid) -> Option<Checkpoint> {
        self.lock().iter().find(|c| c.id == id).cloned()
    }

    /// Most recent checkpoint for `operation_id`
    pub fn latest_for(&self, operation_id: &str) -> Option<Checkpoint> {
        self.lock()
            .iter()
            .rev()
            .find(|c| c.operation_id == operation_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Checkpoint>> {
        self.checkpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
