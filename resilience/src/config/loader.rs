use crate::config::error::{ConfigError, Result};
use crate::escalation::EscalationConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::recovery::RecoveryConfig;
use crate::retry::{AdaptiveConfig, CircuitBreakerConfig, RetryConfig};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry settings used by the RETRY recovery strategy
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Validate the merged configuration against the embedded schema
    #[serde(default = "default_true")]
    pub schema_validation: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            adaptive: AdaptiveConfig::default(),
            recovery: RecoveryConfig::default(),
            escalation: EscalationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            schema_validation: true,
        }
    }
}

/// Configuration loader with layered merging support
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub const ENV_PREFIX: &'static str = "RESILIENCE";

    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration with layered merging:
    /// 1. Start with defaults (from Default implementations)
    /// 2. Merge config file if provided
    /// 3. Override with environment variables (RESILIENCE_ prefix)
    pub fn load(&self) -> Result<ResilienceConfig> {
        let mut builder = Config::builder();

        let defaults_json = serde_json::to_string(&ResilienceConfig::default())?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        // Example: RESILIENCE_ORCHESTRATOR__MAX_CONCURRENT_OPERATIONS=20
        builder = builder.add_source(
            Environment::with_prefix(Self::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("escalation.channels"),
        );

        let config: ResilienceConfig = builder.build()?.try_deserialize()?;

        if config.schema_validation {
            let validator = crate::config::validator::SchemaValidator::new()?;
            validator.validate(&config)?;
        }

        Ok(config)
    }

    /// Locate the default config file in standard locations:
    /// 1. Current directory: ./resilience.toml
    /// 2. XDG config: ~/.config/resilience/config.toml
    /// 3. Home directory: ~/.resilience.toml
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./resilience.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("resilience").join("config.toml");
            if xdg_config.exists() {
                return Some(xdg_config);
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".resilience.toml");
            if home_config.exists() {
                return Some(home_config);
            }
        }

        None
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<ResilienceConfig> {
        match Self::find_config_file() {
            Some(path) => ConfigLoader::new().with_file(path).load(),
            None => ConfigLoader::new().load(),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
