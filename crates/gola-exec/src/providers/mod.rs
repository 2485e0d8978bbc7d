//! Isolation backends ("providers") for running untrusted code.
//!
//! Every backend implements `ProviderAdapter`. The supervisor only ever talks to
//! this trait, so it can fall back from one backend to the next without knowing
//! whether the code runs in a remote sandbox or a local container.

use crate::deadline::ExecContext;
use crate::errors::ExecError;
use crate::types::{ExecutionRequest, ExecutionResult, HealthProbeResult, ProviderDescriptor};
use async_trait::async_trait;

pub mod cloud;
pub mod container;

pub use cloud::{CloudSandboxProvider, CloudSandboxSettings};
pub use container::{ContainerRuntimeProvider, ContainerSettings};

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Static description of the backend. Must not perform I/O.
    fn capabilities(&self) -> ProviderDescriptor;

    /// Lightweight reachability probe. Implementations bound it by their own
    /// probe timeout and report `available: false` when it elapses.
    async fn health_check(&self) -> HealthProbeResult;

    /// Runs `request.source` in the backend's isolation boundary.
    ///
    /// `language` is the canonical identifier resolved by the router. On
    /// `ctx` expiry the adapter kills whatever it started and returns
    /// `Outcome::TimedOut` with the output captured so far. Infrastructure
    /// failures that happen before the code starts are reported as
    /// `Outcome::ProviderUnavailable`. An `Err` is reserved for defects.
    async fn execute(
        &self,
        ctx: &ExecContext,
        language: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecError>;
}

/// Elapsed wall-clock milliseconds since `start`.
pub(crate) fn elapsed_ms(start: tokio::time::Instant) -> u64 {
    start.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}
