//! Configuration loader for YAML files and environment resolution
//!
//! This module handles loading configuration from YAML files and resolving
//! credentials referenced through environment variables.

use crate::config::types::*;
use crate::errors::ExecError;
use std::env;
use std::path::Path;
use tokio::fs;

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<ExecConfig, ExecError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            ExecError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<ExecConfig, ExecError> {
        // serde_yaml maps an empty document to unit, not to an empty mapping.
        let mut config: ExecConfig = if content.trim().is_empty() {
            ExecConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        Self::resolve_environment(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Fill credentials that are configured by environment variable name
    fn resolve_environment(config: &mut ExecConfig) {
        let cloud = &mut config.providers.cloud;
        if cloud.api_key.is_none() {
            if let Some(var) = &cloud.api_key_env {
                match env::var(var) {
                    Ok(value) if !value.is_empty() => {
                        log::debug!("Resolved cloud sandbox API key from ${}", var);
                        cloud.api_key = Some(value);
                    }
                    _ => log::debug!("Cloud sandbox API key variable ${} is not set", var),
                }
            }
        }
    }
}
