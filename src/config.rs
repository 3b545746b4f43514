//! TOML configuration for the pipeline
//!
//! Secrets never live in the config file: credentials are referenced by
//! environment variable name and resolved at runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub mqtt: Option<MqttSection>,
    pub llm: LlmSection,
    #[serde(default)]
    pub auth: Option<AuthSection>,
    #[serde(default)]
    pub telegram: Option<TelegramSection>,
    #[serde(default)]
    pub http: HttpSection,
}

/// Which bus implementation connects the stages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Memory,
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    /// Pipeline identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default = "default_bus")]
    pub bus: BusKind,
    /// Upper bound on one completion provider call
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_secs: u64,
    /// TTL for cached NLU results
    #[serde(default = "default_nlu_cache_ttl")]
    pub nlu_cache_ttl_secs: u64,
    /// TTL for cached auth lookups
    #[serde(default = "default_auth_cache_ttl")]
    pub auth_cache_ttl_secs: u64,
    /// Redelivery budget for the in-memory bus
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSection {
    /// Provider name (currently "openai")
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// Environment variable containing the API key
    pub api_key_env: String,
    /// System prompt for drafted replies
    pub system_prompt: String,
    /// Override the provider base URL (testing and proxies)
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    /// Base URL of the auth service
    pub base_url: String,
    /// Permission the sender must hold
    #[serde(default = "default_send_permission")]
    pub send_permission: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelegramSection {
    /// Environment variable containing the bot token
    pub bot_token_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSection {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

fn default_bus() -> BusKind {
    BusKind::Memory
}

fn default_completion_timeout() -> u64 {
    30
}

fn default_nlu_cache_ttl() -> u64 {
    3600
}

fn default_auth_cache_ttl() -> u64 {
    300
}

fn default_max_redeliveries() -> u32 {
    5
}

fn default_keep_alive() -> u64 {
    60
}

fn default_send_permission() -> String {
    "send_message".to_string()
}

fn default_http_port() -> u16 {
    8080
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid pipeline ID format: {0}")]
    InvalidPipelineId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_pipeline_id(&self.pipeline.id)?;
        if self.pipeline.bus == BusKind::Mqtt && self.mqtt.is_none() {
            return Err(ConfigError::InvalidConfig(
                "bus = \"mqtt\" requires an [mqtt] section".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the completion provider API key from its environment variable.
    pub fn llm_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.llm.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.llm.api_key_env.clone()))
    }

    /// Get the Telegram bot token from its environment variable, if a
    /// Telegram section is configured.
    pub fn telegram_bot_token(&self) -> Result<Option<String>, ConfigError> {
        match &self.telegram {
            Some(section) => std::env::var(&section.bot_token_env)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(section.bot_token_env.clone())),
            None => Ok(None),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[pipeline]
id = "test-pipeline"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
system_prompt = "You are a helpful hotel booking assistant."
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn validate_pipeline_id(id: &str) -> Result<(), ConfigError> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidPipelineId(format!(
            "Pipeline ID '{id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
