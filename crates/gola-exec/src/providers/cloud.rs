//! Adapter for a remote, managed sandbox-execution API
//!
//! The remote side owns runtime installation and its own timeout enforcement, so
//! this adapter is a thin HTTP client. The part that matters is classification:
//! anything that prevents the request from reaching a healthy sandbox becomes
//! `ProviderUnavailable` (the supervisor falls back), while anything that happens
//! after the sandbox accepted the code is final.

use super::{elapsed_ms, ProviderAdapter};
use crate::deadline::ExecContext;
use crate::errors::ExecError;
use crate::types::{
    CapturedOutput, ExecutionRequest, ExecutionResult, HealthProbeResult, ProviderDescriptor,
    ProviderKind,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CloudSandboxSettings {
    pub name: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub priority: i32,
    pub languages: BTreeSet<String>,
    pub network_margin: Duration,
    pub probe_timeout: Duration,
    pub max_output_bytes: usize,
}

impl CloudSandboxSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            name: "cloud".to_string(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: None,
            priority: 10,
            languages: BTreeSet::new(),
            network_margin: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            max_output_bytes: crate::types::DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Body of `POST /v1/execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteExecuteRequest {
    pub request_id: String,
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub stdin: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteExecuteResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

pub struct CloudSandboxProvider {
    client: Client,
    settings: CloudSandboxSettings,
}

impl CloudSandboxProvider {
    pub fn new(settings: CloudSandboxSettings) -> Result<Self, ExecError> {
        if settings.endpoint.is_empty() {
            return Err(ExecError::ConfigError(
                "cloud sandbox provider requires an endpoint".to_string(),
            ));
        }
        let client = Client::builder().build()?;
        Ok(Self { client, settings })
    }

    fn timed_out(
        &self,
        request: &ExecutionRequest,
        language: &str,
        start: Instant,
    ) -> ExecutionResult {
        ExecutionResult::timed_out(
            request,
            language,
            &self.settings.name,
            CapturedOutput::default(),
            CapturedOutput::default(),
            elapsed_ms(start),
        )
    }

    fn map_response(
        &self,
        request: &ExecutionRequest,
        language: &str,
        body: RemoteExecuteResponse,
        start: Instant,
    ) -> ExecutionResult {
        let cap = self.settings.max_output_bytes;
        let stdout = CapturedOutput::from_text(&body.stdout, cap);
        let stderr = CapturedOutput::from_text(&body.stderr, cap);
        let duration_ms = body.duration_ms.unwrap_or_else(|| elapsed_ms(start));
        let name = &self.settings.name;

        if body.timed_out {
            return ExecutionResult::timed_out(request, language, name, stdout, stderr, duration_ms);
        }
        match body.exit_code {
            Some(code) => {
                ExecutionResult::completed(request, language, name, stdout, stderr, code, duration_ms)
            }
            None => ExecutionResult::internal_error(
                request,
                language,
                "remote sandbox returned neither an exit code nor a timeout",
            )
            .with_provider(name)
            .with_duration_ms(duration_ms),
        }
    }
}

#[async_trait]
impl ProviderAdapter for CloudSandboxProvider {
    fn capabilities(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: self.settings.name.clone(),
            kind: ProviderKind::Cloud,
            supported_languages: self.settings.languages.clone(),
            priority: self.settings.priority,
        }
    }

    async fn health_check(&self) -> HealthProbeResult {
        let start = Instant::now();
        let url = format!("{}/v1/health", self.settings.endpoint);
        let probe = self
            .client
            .get(&url)
            .timeout(self.settings.probe_timeout)
            .send();

        match tokio::time::timeout(self.settings.probe_timeout, probe).await {
            Ok(Ok(response)) if response.status().is_success() => HealthProbeResult {
                available: true,
                latency_ms: elapsed_ms(start),
            },
            Ok(Ok(response)) => {
                log::debug!(
                    "Cloud sandbox '{}' health probe returned {}",
                    self.settings.name,
                    response.status()
                );
                HealthProbeResult::unavailable(elapsed_ms(start))
            }
            Ok(Err(e)) => {
                log::debug!("Cloud sandbox '{}' health probe failed: {}", self.settings.name, e);
                HealthProbeResult::unavailable(elapsed_ms(start))
            }
            Err(_) => HealthProbeResult::unavailable(elapsed_ms(start)),
        }
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        language: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecError> {
        let start = Instant::now();
        let budget_secs = ctx.deadline.remaining_secs_ceil();
        let payload = RemoteExecuteRequest {
            request_id: request.request_id.clone(),
            language: language.to_string(),
            source: request.source.clone(),
            stdin: request.stdin.clone(),
            timeout_seconds: budget_secs,
        };

        let url = format!("{}/v1/execute", self.settings.endpoint);
        let mut builder = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(Duration::from_secs(budget_secs) + self.settings.network_margin);
        if let Some(key) = &self.settings.api_key {
            builder = builder.bearer_auth(key);
        }

        log::debug!(
            "[{}] Sending {} source ({} bytes) to cloud sandbox '{}' with {}s budget",
            request.request_id,
            language,
            request.source.len(),
            self.settings.name,
            budget_secs
        );

        // Dropping the in-flight request future closes the connection, which is
        // how the remote session is released on cancellation.
        let response = tokio::select! {
            r = builder.send() => r,
            _ = ctx.expired() => {
                log::warn!("[{}] Cloud sandbox request cancelled at deadline", request.request_id);
                return Ok(self.timed_out(request, language, start));
            }
        };

        let response = match response {
            Ok(response) => response,
            // The request was delivered; the sandbox may already be running the code.
            Err(e) if e.is_timeout() && !e.is_connect() => {
                log::warn!("[{}] Cloud sandbox transport timeout: {}", request.request_id, e);
                return Ok(self.timed_out(request, language, start));
            }
            Err(e) => {
                return Ok(ExecutionResult::provider_unavailable(
                    request,
                    language,
                    &self.settings.name,
                    format!("cloud sandbox unreachable: {}", e),
                ));
            }
        };

        let status = response.status();
        if !status.is_success() {
            // The sandbox refused the request, so the outcome stays unavailable
            // even when the error body is cut off by the deadline.
            let message = tokio::select! {
                text = response.text() => {
                    let error_text = text.unwrap_or_else(|_| {
                        "Unknown error while reading error response body".to_string()
                    });
                    format!("cloud sandbox returned status {}: {}", status, error_text)
                }
                _ = ctx.expired() => {
                    log::warn!(
                        "[{}] Cloud sandbox error body cut off at deadline",
                        request.request_id
                    );
                    format!("cloud sandbox returned status {}", status)
                }
            };
            return Ok(ExecutionResult::provider_unavailable(
                request,
                language,
                &self.settings.name,
                message,
            ));
        }

        let body = tokio::select! {
            b = response.json::<RemoteExecuteResponse>() => b,
            _ = ctx.expired() => {
                log::warn!("[{}] Cloud sandbox response cancelled at deadline", request.request_id);
                return Ok(self.timed_out(request, language, start));
            }
        };

        match body {
            Ok(body) => Ok(self.map_response(request, language, body, start)),
            Err(e) if e.is_timeout() => Ok(self.timed_out(request, language, start)),
            Err(e) => {
                log::error!(
                    "[{}] Failed to parse cloud sandbox response JSON: {}",
                    request.request_id,
                    e
                );
                Ok(ExecutionResult::internal_error(
                    request,
                    language,
                    format!("malformed cloud sandbox response: {}", e),
                )
                .with_provider(&self.settings.name)
                .with_duration_ms(elapsed_ms(start)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::Deadline;
    use crate::test_utils::mock_sandbox_server::{MockReply, MockSandboxServer};
    use crate::types::Outcome;

    fn cloud_provider(endpoint: &str) -> CloudSandboxProvider {
        let settings = CloudSandboxSettings::new(endpoint)
            .with_api_key("secret")
            .with_languages(["python", "javascript"]);
        CloudSandboxProvider::new(settings).unwrap()
    }

    fn ctx(request: &ExecutionRequest) -> ExecContext {
        ExecContext::new(
            request.request_id.clone(),
            Deadline::after(Duration::from_secs(request.timeout_seconds())),
        )
    }

    #[tokio::test]
    async fn test_completed_execution_maps_output() {
        let server = MockSandboxServer::start(vec![MockReply::Json(RemoteExecuteResponse {
            stdout: "2\n".to_string(),
            exit_code: Some(0),
            duration_ms: Some(42),
            ..Default::default()
        })])
        .await;
        let provider = cloud_provider(&server.address());
        let request = ExecutionRequest::new("python", "print(1+1)").with_timeout_seconds(5);

        let result = provider.execute(&ctx(&request), "python", &request).await.unwrap();

        assert_eq!(result.outcome, Outcome::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "2\n");
        assert_eq!(result.duration_ms, 42);
        assert_eq!(result.provider_used.as_deref(), Some("cloud"));

        let recorded = server.recorded_requests.lock().unwrap().clone();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payload.language, "python");
        assert_eq!(recorded[0].payload.timeout_seconds, 5);
        assert_eq!(recorded[0].authorization.as_deref(), Some("Bearer secret"));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_still_completed() {
        let server = MockSandboxServer::start(vec![MockReply::Json(RemoteExecuteResponse {
            stderr: "Traceback".to_string(),
            exit_code: Some(1),
            ..Default::default()
        })])
        .await;
        let provider = cloud_provider(&server.address());
        let request = ExecutionRequest::new("python", "raise SystemExit(1)");

        let result = provider.execute(&ctx(&request), "python", &request).await.unwrap();
        assert_eq!(result.outcome, Outcome::Completed);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.stderr, "Traceback");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_error_is_provider_unavailable() {
        let server = MockSandboxServer::start(vec![MockReply::Status(503)]).await;
        let provider = cloud_provider(&server.address());
        let request = ExecutionRequest::new("python", "print(1)");

        let result = provider.execute(&ctx(&request), "python", &request).await.unwrap();
        assert_eq!(result.outcome, Outcome::ProviderUnavailable);
        assert!(result.exit_code.is_none());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_refused_is_provider_unavailable() {
        let provider = cloud_provider("http://127.0.0.1:1");
        let request = ExecutionRequest::new("python", "print(1)");

        let result = provider.execute(&ctx(&request), "python", &request).await.unwrap();
        assert_eq!(result.outcome, Outcome::ProviderUnavailable);
        assert!(result.error.unwrap().contains("cloud sandbox"));
    }

    #[tokio::test]
    async fn test_remote_timeout_keeps_partial_output() {
        let server = MockSandboxServer::start(vec![MockReply::Json(RemoteExecuteResponse {
            stdout: "partial".to_string(),
            exit_code: Some(137),
            timed_out: true,
            ..Default::default()
        })])
        .await;
        let provider = cloud_provider(&server.address());
        let request = ExecutionRequest::new("python", "while True: pass").with_timeout_seconds(2);

        let result = provider.execute(&ctx(&request), "python", &request).await.unwrap();
        assert_eq!(result.outcome, Outcome::TimedOut);
        assert_eq!(result.stdout, "partial");
        assert!(result.exit_code.is_none());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_hanging_remote_is_cut_at_deadline() {
        let server = MockSandboxServer::start(vec![MockReply::Hang]).await;
        let provider = cloud_provider(&server.address());
        let request = ExecutionRequest::new("python", "while True: pass").with_timeout_seconds(1);

        let started = std::time::Instant::now();
        let result = provider.execute(&ctx(&request), "python", &request).await.unwrap();
        assert_eq!(result.outcome, Outcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));
        // The remote side sees the connection close and drops its handler.
        assert_eq!(server.wait_for_abandoned(1, Duration::from_secs(2)).await, 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_error_body_is_cut_at_deadline() {
        let server = MockSandboxServer::start(vec![MockReply::StalledStatus(503)]).await;
        let provider = cloud_provider(&server.address());
        let request = ExecutionRequest::new("python", "print(1)").with_timeout_seconds(1);

        let started = std::time::Instant::now();
        let result = provider.execute(&ctx(&request), "python", &request).await.unwrap();
        assert_eq!(result.outcome, Outcome::ProviderUnavailable);
        assert_eq!(
            result.error.as_deref(),
            Some("cloud sandbox returned status 503 Service Unavailable")
        );
        assert!(started.elapsed() < Duration::from_secs(3));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_exit_code_is_internal_error() {
        let server =
            MockSandboxServer::start(vec![MockReply::Json(RemoteExecuteResponse::default())]).await;
        let provider = cloud_provider(&server.address());
        let request = ExecutionRequest::new("python", "print(1)");

        let result = provider.execute(&ctx(&request), "python", &request).await.unwrap();
        assert_eq!(result.outcome, Outcome::InternalError);
        assert_eq!(result.provider_used.as_deref(), Some("cloud"));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_output_is_capped() {
        let server = MockSandboxServer::start(vec![MockReply::Json(RemoteExecuteResponse {
            stdout: "x".repeat(64),
            exit_code: Some(0),
            ..Default::default()
        })])
        .await;
        let mut settings = CloudSandboxSettings::new(server.address()).with_languages(["python"]);
        settings.max_output_bytes = 16;
        let provider = CloudSandboxProvider::new(settings).unwrap();
        let request = ExecutionRequest::new("python", "print('x' * 64)");

        let result = provider.execute(&ctx(&request), "python", &request).await.unwrap();
        assert_eq!(result.stdout.len(), 16);
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check_reflects_endpoint() {
        let server = MockSandboxServer::start(vec![]).await;
        let provider = cloud_provider(&server.address());
        assert!(provider.health_check().await.available);

        server.set_healthy(false);
        assert!(!provider.health_check().await.available);
        server.shutdown().await;

        let dead = cloud_provider("http://127.0.0.1:1");
        assert!(!dead.health_check().await.available);
    }

    #[test]
    fn test_capabilities_are_configuration_driven() {
        let descriptor = cloud_provider("http://localhost").capabilities();
        assert_eq!(descriptor.kind, ProviderKind::Cloud);
        assert!(descriptor.supports("javascript"));
        assert!(!descriptor.supports("go"));
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        assert!(CloudSandboxProvider::new(CloudSandboxSettings::new("")).is_err());
    }
}
