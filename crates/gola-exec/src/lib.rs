//! Sandboxed code execution with provider fallback.
//!
//! This crate takes a snippet of source code in a supported language and returns
//! its captured output, running it behind an isolation boundary. Several
//! isolation backends ("providers") can be registered; the service picks among
//! them per request and degrades gracefully when one is unreachable.
//!
//! # Architecture Overview
//!
//! - **Language routing**: alias-tolerant mapping to canonical languages and candidate providers
//! - **Provider adapters**: a remote sandbox API over HTTP and disposable Docker containers
//! - **Health tracking**: background probing plus feedback from real executions
//! - **Supervision**: one overall deadline per request, sequential fallback on infrastructure failure only
//! - **Configuration**: YAML with defaults and environment-resolved credentials

pub mod config;
pub mod deadline;
pub mod errors;
pub mod factory;
pub mod health;
pub mod providers;
pub mod router;
pub mod supervisor;
pub mod types;

pub use config::{ConfigLoader, ExecConfig};
pub use deadline::{Deadline, ExecContext};
pub use errors::ExecError;
pub use factory::ExecutionService;
pub use health::{HealthProber, HealthRecord, HealthRegistry};
pub use providers::ProviderAdapter;
pub use router::LanguageRouter;
pub use supervisor::ExecutionSupervisor;
pub use types::{
    ExecutionRequest, ExecutionResult, HealthProbeResult, Outcome, ProviderDescriptor,
    ProviderKind,
};

#[cfg(test)]
pub mod test_utils;
