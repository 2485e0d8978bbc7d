//! Configuration type definitions for the execution service
//!
//! Every field has a default. The one value an operator must supply is the cloud
//! endpoint, or `providers.cloud.enabled: false` for a container-only deployment.
//! Resource caps and image overrides are optional.

use crate::errors::ExecError;
use crate::types::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 1 TiB. Anything above is a typo, and the byte count must fit Docker's i64.
pub const MAX_CONTAINER_MEMORY_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub languages: LanguagesConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Disables every provider that needs outbound network access.
    #[serde(default)]
    pub offline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguagesConfig {
    /// Extra alias -> canonical language mappings.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub cloud: CloudProviderConfig,
    #[serde(default)]
    pub container: ContainerProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cloud_name")]
    pub name: String,
    #[serde(default = "default_cloud_priority")]
    pub priority: i32,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_cloud_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_network_margin_seconds")]
    pub network_margin_seconds: u64,
    #[serde(default = "default_cloud_languages")]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_container_name")]
    pub name: String,
    #[serde(default = "default_container_priority")]
    pub priority: i32,
    #[serde(default)]
    pub docker_host: Option<String>,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default = "default_true")]
    pub pull_missing_images: bool,
    #[serde(default)]
    pub images: HashMap<String, String>,
    #[serde(default = "default_container_user")]
    pub user: Option<String>,
}

impl ExecConfig {
    pub fn validate(&self) -> Result<(), ExecError> {
        let cloud = &self.providers.cloud;
        let container = &self.providers.container;
        let cloud_active = cloud.enabled && !self.execution.offline;

        if !cloud_active && !container.enabled {
            return Err(ExecError::ConfigError(
                "at least one provider must be enabled".to_string(),
            ));
        }
        if cloud_active {
            match cloud.endpoint.as_deref() {
                Some(endpoint) if !endpoint.trim().is_empty() => {}
                _ => {
                    return Err(ExecError::ConfigError(
                        "providers.cloud.endpoint is required when the cloud provider is enabled"
                            .to_string(),
                    ))
                }
            }
            if cloud.languages.is_empty() {
                return Err(ExecError::ConfigError(
                    "providers.cloud.languages must not be empty".to_string(),
                ));
            }
        }
        if cloud_active && container.enabled && cloud.name == container.name {
            return Err(ExecError::ConfigError(format!(
                "provider name '{}' is used twice",
                cloud.name
            )));
        }
        if container.enabled {
            if container.memory_mb == 0 {
                return Err(ExecError::ConfigError(
                    "providers.container.memory_mb must be positive".to_string(),
                ));
            }
            if container.memory_mb > MAX_CONTAINER_MEMORY_MB {
                return Err(ExecError::ConfigError(format!(
                    "providers.container.memory_mb must not exceed {}",
                    MAX_CONTAINER_MEMORY_MB
                )));
            }
            if !(container.cpus > 0.0) {
                return Err(ExecError::ConfigError(
                    "providers.container.cpus must be positive".to_string(),
                ));
            }
            if container.pids_limit <= 0 {
                return Err(ExecError::ConfigError(
                    "providers.container.pids_limit must be positive".to_string(),
                ));
            }
        }
        if self.execution.max_output_bytes == 0 {
            return Err(ExecError::ConfigError(
                "execution.max_output_bytes must be positive".to_string(),
            ));
        }
        if self.execution.default_timeout_seconds == 0
            || self.execution.default_timeout_seconds > MAX_TIMEOUT_SECONDS
        {
            return Err(ExecError::ConfigError(format!(
                "execution.default_timeout_seconds must be between 1 and {}",
                MAX_TIMEOUT_SECONDS
            )));
        }
        if self.health.probe_interval_seconds == 0 {
            return Err(ExecError::ConfigError(
                "health.probe_interval_seconds must be positive".to_string(),
            ));
        }
        for (alias, canonical) in &self.languages.aliases {
            if alias.trim().is_empty() || canonical.trim().is_empty() {
                return Err(ExecError::ConfigError(format!(
                    "invalid language alias '{}' -> '{}'",
                    alias, canonical
                )));
            }
        }
        Ok(())
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
            teardown_grace_ms: default_teardown_grace_ms(),
            max_output_bytes: default_max_output_bytes(),
            offline: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_seconds: default_probe_interval_seconds(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl Default for CloudProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_cloud_name(),
            priority: default_cloud_priority(),
            endpoint: None,
            api_key: None,
            api_key_env: default_cloud_api_key_env(),
            network_margin_seconds: default_network_margin_seconds(),
            languages: default_cloud_languages(),
        }
    }
}

impl Default for ContainerProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_container_name(),
            priority: default_container_priority(),
            docker_host: None,
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            allow_network: false,
            pull_missing_images: true,
            images: HashMap::new(),
            user: default_container_user(),
        }
    }
}

fn default_timeout_seconds() -> u64 { DEFAULT_TIMEOUT_SECONDS }
fn default_teardown_grace_ms() -> u64 { 1500 }
fn default_max_output_bytes() -> usize { DEFAULT_MAX_OUTPUT_BYTES }
fn default_probe_interval_seconds() -> u64 { 30 }
fn default_probe_timeout_ms() -> u64 { 2000 }
fn default_failure_threshold() -> u32 { 3 }
fn default_true() -> bool { true }
fn default_cloud_name() -> String { "cloud".to_string() }
fn default_cloud_priority() -> i32 { 10 }
fn default_cloud_api_key_env() -> Option<String> { Some("SANDBOX_API_KEY".to_string()) }
fn default_network_margin_seconds() -> u64 { 5 }
fn default_container_name() -> String { "container".to_string() }
fn default_container_priority() -> i32 { 20 }
fn default_memory_mb() -> u64 { 256 }
fn default_cpus() -> f64 { 0.5 }
fn default_pids_limit() -> i64 { 64 }
fn default_container_user() -> Option<String> { Some("65534:65534".to_string()) }

fn default_cloud_languages() -> Vec<String> {
    [
        "python", "javascript", "typescript", "ruby", "go", "rust", "c", "cpp", "java", "bash",
        "php",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
