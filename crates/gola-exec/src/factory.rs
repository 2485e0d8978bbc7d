//! Wiring of providers, health tracking and the supervisor from configuration.

use crate::config::ExecConfig;
use crate::errors::ExecError;
use crate::health::{HealthProber, HealthRegistry};
use crate::providers::{
    CloudSandboxProvider, CloudSandboxSettings, ContainerRuntimeProvider, ContainerSettings,
    ProviderAdapter,
};
use crate::supervisor::ExecutionSupervisor;
use crate::types::{ExecutionRequest, ExecutionResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running execution service: the supervisor plus its background prober.
pub struct ExecutionService {
    supervisor: Arc<ExecutionSupervisor>,
    default_timeout_seconds: u64,
    shutdown: CancellationToken,
    prober: Option<JoinHandle<()>>,
}

impl ExecutionService {
    pub fn build_providers(config: &ExecConfig) -> Result<Vec<Arc<dyn ProviderAdapter>>, ExecError> {
        let execution = &config.execution;
        let probe_timeout = Duration::from_millis(config.health.probe_timeout_ms);
        let mut providers: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

        let cloud = &config.providers.cloud;
        if cloud.enabled && execution.offline {
            log::info!("Offline mode: cloud sandbox provider '{}' disabled", cloud.name);
        } else if cloud.enabled {
            let endpoint = cloud.endpoint.clone().ok_or_else(|| {
                ExecError::ConfigError("cloud provider enabled without endpoint".to_string())
            })?;
            let mut settings = CloudSandboxSettings::new(endpoint)
                .with_priority(cloud.priority)
                .with_languages(cloud.languages.iter().map(|l| l.trim().to_lowercase()));
            settings.name = cloud.name.clone();
            settings.api_key = cloud.api_key.clone();
            settings.network_margin = Duration::from_secs(cloud.network_margin_seconds);
            settings.probe_timeout = probe_timeout;
            settings.max_output_bytes = execution.max_output_bytes;
            log::info!(
                "Registered cloud sandbox provider '{}' at {} (priority {})",
                settings.name,
                settings.endpoint,
                settings.priority
            );
            providers.push(Arc::new(CloudSandboxProvider::new(settings)?));
        }

        let container = &config.providers.container;
        if container.enabled {
            let settings = ContainerSettings {
                name: container.name.clone(),
                priority: container.priority,
                docker_host: container.docker_host.clone(),
                memory_mb: container.memory_mb,
                cpus: container.cpus,
                pids_limit: container.pids_limit,
                allow_network: container.allow_network,
                pull_missing_images: container.pull_missing_images,
                images: container.images.clone(),
                user: container.user.clone(),
                max_output_bytes: execution.max_output_bytes,
                probe_timeout,
                teardown_grace: Duration::from_millis(execution.teardown_grace_ms),
            };
            if settings.allow_network {
                log::warn!("Container provider '{}' allows network access", settings.name);
            }
            match ContainerRuntimeProvider::new(settings) {
                Ok(provider) => {
                    log::info!(
                        "Registered container provider '{}' (priority {})",
                        container.name,
                        container.priority
                    );
                    providers.push(Arc::new(provider));
                }
                Err(e) => log::error!(
                    "Container provider '{}' could not be created, skipping: {}",
                    container.name,
                    e
                ),
            }
        }

        if providers.is_empty() {
            return Err(ExecError::ConfigError(
                "no execution provider could be created".to_string(),
            ));
        }
        Ok(providers)
    }

    pub fn from_config(config: &ExecConfig) -> Result<Self, ExecError> {
        let providers = Self::build_providers(config)?;
        Ok(Self::with_providers(config, providers))
    }

    /// Assembles the service around an explicit provider list and starts probing.
    pub fn with_providers(config: &ExecConfig, providers: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        let names: Vec<String> = providers.iter().map(|p| p.capabilities().name).collect();
        let registry = Arc::new(HealthRegistry::new(names, config.health.failure_threshold));
        let supervisor = ExecutionSupervisor::new(providers.clone(), registry.clone())
            .with_aliases(&config.languages.aliases)
            .with_teardown_grace(Duration::from_millis(config.execution.teardown_grace_ms));

        let shutdown = CancellationToken::new();
        let prober = HealthProber::spawn(
            registry,
            providers,
            Duration::from_secs(config.health.probe_interval_seconds),
            Duration::from_millis(config.health.probe_timeout_ms),
            shutdown.clone(),
        );

        Self {
            supervisor: Arc::new(supervisor),
            default_timeout_seconds: config.execution.default_timeout_seconds,
            shutdown,
            prober: Some(prober),
        }
    }

    pub fn supervisor(&self) -> Arc<ExecutionSupervisor> {
        self.supervisor.clone()
    }

    /// Builds a request the way tool-invocation callers submit them, applying the
    /// configured default when no timeout was given.
    pub fn request(
        &self,
        language: impl Into<String>,
        source: impl Into<String>,
        timeout_seconds: Option<i64>,
        stdin: Option<String>,
    ) -> ExecutionRequest {
        let timeout = timeout_seconds.unwrap_or(self.default_timeout_seconds as i64);
        let mut request = ExecutionRequest::new(language, source).with_timeout_seconds(timeout);
        request.stdin = stdin;
        request
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.supervisor.execute(request).await
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(prober) = self.prober.take() {
            if let Err(e) = prober.await {
                log::warn!("Health prober ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ExecutionService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
