//! Range checks for [`ResilienceConfig`] against the embedded Draft 7 schema

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::config::error::{ConfigError, Result};
use crate::config::loader::ResilienceConfig;

const SCHEMA: &str = include_str!("schemas/resilience_config.schema.json");

/// One out-of-range or mistyped setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted setting path, e.g. `retry.jitter_factor`
    pub setting: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.setting, self.message)
    }
}

pub struct SchemaValidator {
    schema: JSONSchema,
}

impl SchemaValidator {
    pub fn new() -> Result<Self> {
        let document: Value = serde_json::from_str(SCHEMA)?;
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&document)
            .map_err(|e| {
                ConfigError::SchemaValidationError(format!("bad embedded schema: {e}"))
            })?;
        Ok(Self { schema })
    }

    /// Every setting the schema rejects, in schema order
    pub fn violations(&self, config: &ResilienceConfig) -> Result<Vec<Violation>> {
        let document = serde_json::to_value(config)?;
        let violations = match self.schema.validate(&document) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| Violation {
                    setting: dotted(&e.instance_path.to_string()),
                    message: e.to_string(),
                })
                .collect(),
        };
        Ok(violations)
    }

    /// Fails with all violations joined into one message
    pub fn validate(&self, config: &ResilienceConfig) -> Result<()> {
        let violations = self.violations(config)?;
        if violations.is_empty() {
            return Ok(());
        }

        let count = violations.len();
        let listed = violations
            .iter()
            .map(Violation::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(ConfigError::SchemaValidationError(format!(
            "{count} invalid setting{}: {listed}",
            if count == 1 { "" } else { "s" }
        )))
    }
}

/// `/retry/jitter_factor` → `retry.jitter_factor`
fn dotted(pointer: &str) -> String {
    let path = pointer.trim_start_matches('/').replace('/', ".");
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path
    }
}
