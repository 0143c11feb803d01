use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config = load_config_from_str(&content)?;
    apply_env_overrides(&mut config);
    validate_config(&config)?;

    Ok(config)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Applies `SHAREBOX_*` environment overrides on top of a loaded config.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(dir) = std::env::var("SHAREBOX_DATA_DIR") {
        log::debug!("Data directory overridden from environment");
        config.data_directory = dir;
    }
    if let Ok(dir) = std::env::var("SHAREBOX_STAGING_DIR") {
        config.staging_directory = dir;
    }
    if let Ok(dir) = std::env::var("SHAREBOX_DESTINATION_DIR") {
        config.destination_directory = dir;
    }
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.allowed_extensions.is_empty() {
        return Err(ConfigError::Validation {
            message: "allowed_extensions must not be empty".to_string(),
        });
    }

    if config.staging_root() == config.destination_root() {
        return Err(ConfigError::Validation {
            message: "staging and destination directories must differ".to_string(),
        });
    }

    let trash = config.trash_root();
    if trash.starts_with(config.destination_root()) || trash.starts_with(config.staging_root()) {
        return Err(ConfigError::Validation {
            message: "trash directory must lie outside the staging and destination trees"
                .to_string(),
        });
    }

    if config.index.quiet_period_secs == 0 || config.index.poll_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "index intervals must be greater than zero".to_string(),
        });
    }

    Ok(())
}
