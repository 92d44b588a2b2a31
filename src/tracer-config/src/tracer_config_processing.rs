use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::tracer_config::TracerConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParseError(#[from] serde_yaml::Error),

    #[error("Invalid placeholder pattern: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Config validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

impl TracerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading tracer configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml_content: &str) -> Result<Self> {
        let expanded_content = expand_env_vars(yaml_content)?;
        let config: TracerConfig = serde_yaml::from_str(&expanded_content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let kafka = &self.kafka;

        if kafka.bootstrap_servers.trim().is_empty() {
            return Err(invalid("kafka.bootstrap_servers must not be empty"));
        }
        if kafka.group_id.trim().is_empty() {
            return Err(invalid("kafka.group_id must not be empty"));
        }
        if kafka.topics.is_empty() || kafka.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(invalid("kafka.topics must list at least one non-empty topic"));
        }
        if kafka.min_batch_size == 0 {
            return Err(invalid("kafka.min_batch_size must be at least 1"));
        }
        if kafka.poll_timeout_ms == 0 {
            return Err(invalid("kafka.poll_timeout_ms must be at least 1"));
        }
        if kafka.max_poll_records == 0 {
            return Err(invalid("kafka.max_poll_records must be at least 1"));
        }
        match kafka.auto_offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "kafka.auto_offset_reset must be 'earliest' or 'latest', got '{}'",
                    other
                )))
            }
        }

        if !self.postgres.url.contains("://") {
            return Err(invalid(
                "postgres.url must look like postgresql://[user[:password]@][host][:port][/database]",
            ));
        }
        if self.postgres.max_connections == 0 {
            return Err(invalid("postgres.max_connections must be at least 1"));
        }

        if self.partition.fixed_offset().is_none() {
            return Err(ConfigError::ValidationError(format!(
                "partition.utc_offset_minutes {} is outside ±24h",
                self.partition.utc_offset_minutes
            )));
        }

        if self.bootstrap.window_days == 0 {
            return Err(invalid("bootstrap.window_days must be at least 1"));
        }
        if self.bootstrap.interval_secs == 0 {
            return Err(invalid("bootstrap.interval_secs must be at least 1"));
        }

        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let env_var_pattern = regex::Regex::new(r"\$\{([^}]+)\}")?;

    for cap in env_var_pattern.captures_iter(content) {
        let var_name = &cap[1];
        let placeholder = format!("${{{}}}", var_name);

        match std::env::var(var_name) {
            Ok(env_value) => {
                result = result.replace(&placeholder, &env_value);
            }
            Err(_) => {
                warn!("Environment variable '{}' not found, using empty string", var_name);
                result = result.replace(&placeholder, "");
            }
        }
    }

    Ok(result)
}
