//! Configuration for the Dropzone agent.
//!
//! An [`AgentConfig`] is read from TOML or JSON (see
//! [`AgentConfig::load_from_env`] for the lookup order), checked with
//! [`validate`], and turned into [`dropzone_core::OrchestratorSettings`].

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{CONFIG_JSON_VAR, CONFIG_PATH_VAR, ConfigSource};
pub use models::plugins::PluginsConfig;
pub use models::{AgentConfig, BaselineConfig, ClassificationConfig, UploadConfig};
pub use validation::{ConfigError, ConfigWarning, ConfigWarnings, validate};
