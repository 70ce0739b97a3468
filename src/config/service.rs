//! Service settings loaded from a TOML file
//!
//! Every section is optional; missing values fall back to the defaults below.
//! - `[model]`: which provider to call and the fixed sampling parameters
//! - `[history]`: how conversations are summarized in listings

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Root service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub history: HistoryConfig,
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let model = &self.model;
        if model.max_tokens == 0 {
            return Err(ConfigError::Validation("model.max_tokens must be positive".into()));
        }
        if !(0.0..=1.0).contains(&model.temperature) {
            return Err(ConfigError::Validation(format!(
                "model.temperature must be within 0..=1, got {}",
                model.temperature
            )));
        }
        if !(0.0..=1.0).contains(&model.top_p) {
            return Err(ConfigError::Validation(format!(
                "model.top_p must be within 0..=1, got {}",
                model.top_p
            )));
        }
        if self.history.preview_chars == 0 {
            return Err(ConfigError::Validation("history.preview_chars must be positive".into()));
        }
        Ok(())
    }
}

/// Model provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name; only "anthropic" is built in
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub name: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    "claude-3-5-sonnet-20240620".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.3
}

fn default_top_p() -> f32 {
    1.0
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_endpoint() -> String {
    "https://api.anthropic.com".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            name: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            api_key_env: default_api_key_env(),
            endpoint: default_endpoint(),
        }
    }
}

/// Conversation listing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Characters of the first user message shown as a preview
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

fn default_preview_chars() -> usize {
    100
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            preview_chars: default_preview_chars(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
[model]
provider = "anthropic"
name = "claude-3-haiku-20240307"
max_tokens = 1024
temperature = 0.7
api_key_env = "MY_KEY"
endpoint = "http://localhost:8080"

[history]
preview_chars = 40
"#;

    #[test]
    fn test_parse_config() {
        let config = ServiceConfig::from_str(SAMPLE_CONFIG).unwrap();

        assert_eq!(config.model.name, "claude-3-haiku-20240307");
        assert_eq!(config.model.max_tokens, 1024);
        assert!((config.model.temperature - 0.7).abs() < f32::EPSILON);
        assert!((config.model.top_p - 1.0).abs() < f32::EPSILON); // Default
        assert_eq!(config.model.api_key_env, "MY_KEY");
        assert_eq!(config.model.endpoint, "http://localhost:8080");
        assert_eq!(config.history.preview_chars, 40);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ServiceConfig::from_str("").unwrap();
        assert_eq!(config.model.provider, "anthropic");
        assert_eq!(config.model.max_tokens, 8192);
        assert_eq!(config.history.preview_chars, 100);
    }

    #[test]
    fn test_rejects_out_of_range_sampling() {
        let err = ServiceConfig::from_str("[model]\ntemperature = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = ServiceConfig::from_str("[history]\npreview_chars = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = ServiceConfig::from_str("[model\nname = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
