//! # formwork-config
//!
//! Single-file YAML configuration for the Formwork engine. All fields
//! default, so an empty file is a valid configuration.
//!
//! ```yaml
//! version: 1
//! app:
//!   name: formwork
//! pipeline:
//!   stage_timeout_secs: 120
//!   generation_retries: 3
//!   max_iterations: 10
//! watcher:
//!   enabled: true
//!   repeated_failure_threshold: 3
//!   empty_streak_threshold: 2
//! gate:
//!   max_new_per_category: 1
//!   min_reference_ids: 2
//! provider:
//!   model: gpt-4o-mini
//!   base_url: https://api.openai.com/v1
//!   api_key_env: OPENAI_API_KEY
//! library:
//!   path: strategy_library.md
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FormworkConfig {
    pub version: u32,
    pub app: AppConfig,
    pub pipeline: PipelineConfig,
    pub watcher: WatcherConfig,
    pub gate: GateConfig,
    pub provider: ProviderConfig,
    pub library: LibraryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "formwork".to_string(),
            environment: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Deadline for one stage generation call.
    pub stage_timeout_secs: u64,
    /// Attempts per stage before the pipeline fails.
    pub generation_retries: u32,
    /// Execution-loop iterations before giving up on a plan.
    pub max_iterations: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: 120,
            generation_retries: 3,
            max_iterations: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    /// Consecutive matching failures on one step before rollback.
    pub repeated_failure_threshold: usize,
    /// Consecutive empty tool outputs before replan.
    pub empty_streak_threshold: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repeated_failure_threshold: 3,
            empty_streak_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub max_new_per_category: usize,
    pub min_reference_ids: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_new_per_category: 1,
            min_reference_ids: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key; never the key itself.
    pub api_key_env: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.2,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub path: String,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            path: "strategy_library.md".to_string(),
        }
    }
}

/// Load and validate configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<FormworkConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: FormworkConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &FormworkConfig) -> Result<(), ConfigError> {
    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }
    if config.pipeline.generation_retries == 0 {
        return Err(ConfigError::Invalid(
            "pipeline.generation_retries must be > 0".to_string(),
        ));
    }
    if config.pipeline.max_iterations == 0 {
        return Err(ConfigError::Invalid(
            "pipeline.max_iterations must be > 0".to_string(),
        ));
    }
    if config.pipeline.stage_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "pipeline.stage_timeout_secs must be > 0".to_string(),
        ));
    }
    if config.watcher.enabled {
        if config.watcher.repeated_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "watcher.repeated_failure_threshold must be > 0".to_string(),
            ));
        }
        if config.watcher.empty_streak_threshold == 0 {
            return Err(ConfigError::Invalid(
                "watcher.empty_streak_threshold must be > 0".to_string(),
            ));
        }
    }
    if config.provider.model.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "provider.model must not be empty".to_string(),
        ));
    }
    if config.library.path.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "library.path must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FormworkConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.watcher.repeated_failure_threshold, 3);
        assert_eq!(config.gate.max_new_per_category, 1);
    }

    #[test]
    fn test_empty_yaml_yields_defaults() {
        let config: FormworkConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.pipeline.max_iterations, 10);
        assert_eq!(config.provider.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = "pipeline:\n  max_iterations: 25\nwatcher:\n  enabled: false\n";
        let config: FormworkConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pipeline.max_iterations, 25);
        assert!(!config.watcher.enabled);
        assert_eq!(config.pipeline.generation_retries, 3);
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut config = FormworkConfig::default();
        config.pipeline.generation_retries = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_disabled_watcher_skips_threshold_checks() {
        let mut config = FormworkConfig::default();
        config.watcher.enabled = false;
        config.watcher.empty_streak_threshold = 0;
        assert!(validate_config(&config).is_ok());
    }
}
