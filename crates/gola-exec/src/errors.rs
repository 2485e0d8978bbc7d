//! Error types for the code execution service
//!
//! These errors are the internal failure channel: configuration problems, provider
//! construction failures and adapter defects. Expected failure modes of running
//! user code (non-zero exits, timeouts, a backend being down) are never errors at
//! the service boundary; they are reported as an `Outcome` on the `ExecutionResult`.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ExecError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Provider '{provider}' unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },
    #[error("Docker operation failed: {0}")]
    DockerError(String),
    #[error("HTTP request failed: {0}")]
    HttpError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ExecError {
    pub fn unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ExecError::ProviderUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for ExecError {
    fn from(err: reqwest::Error) -> Self {
        ExecError::HttpError(err.to_string())
    }
}

impl From<bollard::errors::Error> for ExecError {
    fn from(err: bollard::errors::Error) -> Self {
        ExecError::DockerError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ExecError {
    fn from(err: serde_yaml::Error) -> Self {
        ExecError::ConfigError(format!("Failed to parse YAML config: {}", err))
    }
}
