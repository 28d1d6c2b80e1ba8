/// Layered configuration for the resilience core
///
/// Sources, lowest precedence first:
/// 1. Defaults (from code)
/// 2. Config file (resilience.toml)
/// 3. Environment variables (RESILIENCE_* prefix, `__` for nesting)
///
/// # Example
///
/// ```no_run
/// use ci_resilience::config::ConfigLoader;
///
/// // Load from default locations
/// let config = ConfigLoader::load_default()?;
///
/// // Or load from a specific file
/// let config = ConfigLoader::new().with_file("./ci/resilience.toml").load()?;
/// # Ok::<(), ci_resilience::config::ConfigError>(())
/// ```
pub mod error;
pub mod loader;
pub mod validator;

pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, ResilienceConfig};
pub use validator::{SchemaValidator, Violation};
