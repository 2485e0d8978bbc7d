// src/providers/container.rs
//! Disposable, resource-capped Docker containers, one per request.
//!
//! Each execution gets a fresh container from a pre-provisioned language image
//! with a read-only bind mount holding the source and stdin. Resource limits and
//! network isolation are always applied. The container is force-removed on every
//! exit path, including when the execution future itself is aborted.

use super::{elapsed_ms, ProviderAdapter};
use crate::deadline::ExecContext;
use crate::errors::ExecError;
use crate::types::{
    ExecutionRequest, ExecutionResult, HealthProbeResult, Outcome, OutputCapture,
    ProviderDescriptor, ProviderKind,
};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    KillContainerOptions as BollardKillContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tempfile::{Builder, TempDir};
use tokio::time::Instant;
use uuid::Uuid;

const WORKSPACE_MOUNT: &str = "/workspace";
const ENTRYPOINT_FILE: &str = "entry.sh";
const STDIN_FILE: &str = "stdin";
const SIGKILL_EXIT_CODE: i64 = 137;

/// How a canonical language is run inside its image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageImage {
    pub image: String,
    pub source_file: &'static str,
    pub run: &'static str,
    pub env: &'static [&'static str],
}

fn builtin_image(language: &str) -> Option<LanguageImage> {
    let (image, source_file, run, env): (&str, &'static str, &'static str, &'static [&'static str]) =
        match language {
            "python" => ("python:3.12-slim", "main.py", "python3 main.py", &["PYTHONDONTWRITEBYTECODE=1"]),
            "javascript" => ("node:20-slim", "main.js", "node main.js", &[]),
            "typescript" => (
                "denoland/deno:alpine",
                "main.ts",
                "deno run --quiet --no-prompt main.ts",
                &["DENO_DIR=/tmp/deno"],
            ),
            "ruby" => ("ruby:3.3-slim", "main.rb", "ruby main.rb", &[]),
            "go" => (
                "golang:1.22-alpine",
                "main.go",
                "go run main.go",
                &["GOCACHE=/tmp/go-cache", "GOPATH=/tmp/go", "HOME=/tmp"],
            ),
            "rust" => ("rust:1-slim", "main.rs", "rustc -o /tmp/main main.rs && /tmp/main", &[]),
            "c" => ("gcc:13", "main.c", "gcc -O2 -o /tmp/main main.c && /tmp/main", &[]),
            "cpp" => ("gcc:13", "main.cpp", "g++ -O2 -o /tmp/main main.cpp && /tmp/main", &[]),
            "java" => ("eclipse-temurin:21-jdk", "Main.java", "java Main.java", &["HOME=/tmp"]),
            "bash" => ("bash:5", "main.sh", "bash main.sh", &[]),
            "php" => ("php:8.3-cli", "main.php", "php main.php", &[]),
            _ => return None,
        };
    Some(LanguageImage {
        image: image.to_string(),
        source_file,
        run,
        env,
    })
}

const BUILTIN_LANGUAGES: &[&str] = &[
    "python", "javascript", "typescript", "ruby", "go", "rust", "c", "cpp", "java", "bash", "php",
];

#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub name: String,
    pub priority: i32,
    pub docker_host: Option<String>,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: i64,
    pub allow_network: bool,
    pub pull_missing_images: bool,
    /// Image overrides keyed by canonical language.
    pub images: HashMap<String, String>,
    pub user: Option<String>,
    pub max_output_bytes: usize,
    pub probe_timeout: Duration,
    pub teardown_grace: Duration,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            name: "container".to_string(),
            priority: 20,
            docker_host: None,
            memory_mb: 256,
            cpus: 0.5,
            pids_limit: 64,
            allow_network: false,
            pull_missing_images: true,
            images: HashMap::new(),
            user: Some("65534:65534".to_string()),
            max_output_bytes: crate::types::DEFAULT_MAX_OUTPUT_BYTES,
            probe_timeout: Duration::from_secs(2),
            teardown_grace: Duration::from_millis(1500),
        }
    }
}

impl ContainerSettings {
    pub fn language_image(&self, language: &str) -> Option<LanguageImage> {
        let mut spec = builtin_image(language)?;
        if let Some(image) = self.images.get(language) {
            spec.image = image.clone();
        }
        Some(spec)
    }

    pub fn host_config(&self, workspace: &Path) -> HostConfig {
        let memory = i64::try_from(self.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX);
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,exec,size=64m".to_string());

        HostConfig {
            binds: Some(vec![format!(
                "{}:{}:ro",
                workspace.display(),
                WORKSPACE_MOUNT
            )]),
            memory: Some(memory),
            memory_swap: Some(memory),
            nano_cpus: Some((self.cpus * 1_000_000_000.0) as i64),
            pids_limit: Some(self.pids_limit),
            network_mode: Some(if self.allow_network { "bridge" } else { "none" }.to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            tmpfs: Some(tmpfs),
            ..Default::default()
        }
    }
}

/// Shell script executed as the container's main process.
pub fn entrypoint_script(spec: &LanguageImage) -> String {
    format!(
        "cd {mount}\nexec 0< {mount}/{stdin}\n{run}\n",
        mount = WORKSPACE_MOUNT,
        stdin = STDIN_FILE,
        run = spec.run
    )
}

/// Force-removes the container when released or dropped.
struct ContainerGuard {
    docker: Docker,
    id: Option<String>,
    _workspace: TempDir,
}

impl ContainerGuard {
    /// Waits for the removal. The removal runs in its own task, so aborting the
    /// caller does not abandon it.
    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            if let Some(removal) = spawn_removal(&self.docker, id) {
                if let Err(e) = removal.await {
                    log::warn!("Container removal task failed: {}", e);
                }
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            spawn_removal(&self.docker, id);
        }
    }
}

fn spawn_removal(docker: &Docker, id: String) -> Option<tokio::task::JoinHandle<()>> {
    let docker = docker.clone();
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(async move {
            remove_container(&docker, &id).await;
        })),
        Err(_) => {
            log::error!("Container {} leaked: no runtime available for cleanup", id);
            None
        }
    }
}

async fn remove_container(docker: &Docker, id: &str) {
    let options = BollardRemoveContainerOptionsQuery {
        force: true,
        v: true,
        ..Default::default()
    };
    match docker.remove_container(id, Some(options)).await {
        Ok(()) => log::debug!("Removed container {}", id),
        Err(e) => log::warn!("Failed to remove container {}: {}", id, e),
    }
}

async fn wait_for_exit(docker: &Docker, id: &str) -> Result<i64, ExecError> {
    let mut stream = docker.wait_container(id, None::<BollardWaitContainerOptionsQuery>);
    match stream.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        // bollard reports non-zero exits as an error carrying the code.
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(e.into()),
        None => Err(ExecError::DockerError(
            "Container wait stream ended unexpectedly".to_string(),
        )),
    }
}

async fn collect_logs(
    docker: &Docker,
    id: &str,
    stdout: &mut OutputCapture,
    stderr: &mut OutputCapture,
) {
    let mut stream = docker.logs(
        id,
        Some(BollardLogsOptionsQuery {
            stdout: true,
            stderr: true,
            ..Default::default()
        }),
    );
    while let Some(item) = stream.next().await {
        match item {
            Ok(LogOutput::StdOut { message }) => stdout.push(&message),
            Ok(LogOutput::StdErr { message }) => stderr.push(&message),
            Ok(_) => {}
            Err(e) => {
                log::warn!("Failed to read logs for container {}: {}", id, e);
                break;
            }
        }
        if stdout.is_truncated() && stderr.is_truncated() {
            break;
        }
    }
}

fn is_missing_image(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Writes source, stdin and the entrypoint into a fresh host directory that is
/// bind-mounted into the container.
fn prepare_workspace(spec: &LanguageImage, request: &ExecutionRequest) -> Result<TempDir, ExecError> {
    let dir = Builder::new().prefix("gola-exec-").tempdir()?;
    std::fs::write(dir.path().join(spec.source_file), &request.source)?;
    std::fs::write(
        dir.path().join(STDIN_FILE),
        request.stdin.as_deref().unwrap_or(""),
    )?;
    std::fs::write(dir.path().join(ENTRYPOINT_FILE), entrypoint_script(spec))?;

    // The container runs as an unprivileged user that must read the mount.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755))?;
        for file in [spec.source_file, STDIN_FILE, ENTRYPOINT_FILE] {
            std::fs::set_permissions(
                dir.path().join(file),
                std::fs::Permissions::from_mode(0o644),
            )?;
        }
    }
    Ok(dir)
}

pub struct ContainerRuntimeProvider {
    docker: Docker,
    settings: ContainerSettings,
}

impl ContainerRuntimeProvider {
    /// Builds the Docker client without calling the API. With local defaults
    /// this still fails when the Docker socket does not exist.
    pub fn new(settings: ContainerSettings) -> Result<Self, ExecError> {
        let docker = match settings.docker_host.as_deref() {
            Some(host) if host.starts_with("unix://") => Docker::connect_with_socket(
                host.trim_start_matches("unix://"),
                120,
                bollard::API_DEFAULT_VERSION,
            )?,
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)?,
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker, settings })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ExecError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_missing_image(&e) && self.settings.pull_missing_images => {}
            Err(e) => return Err(e.into()),
        }

        log::info!("Pulling image {} for container provider", image);
        let pull_options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });
        let mut pull_stream = self.docker.create_image(pull_options, None, None);
        while let Some(progress) = pull_stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn create_and_start(
        &self,
        spec: &LanguageImage,
        container_name: &str,
        workspace: TempDir,
        timeout_secs: u64,
    ) -> Result<ContainerGuard, ExecError> {
        self.ensure_image(&spec.image).await?;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(container_name.to_string()),
            ..Default::default()
        });
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "timeout".to_string(),
                "-s".to_string(),
                "KILL".to_string(),
                timeout_secs.to_string(),
                "sh".to_string(),
                format!("{}/{}", WORKSPACE_MOUNT, ENTRYPOINT_FILE),
            ]),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            env: Some(spec.env.iter().map(|e| e.to_string()).collect()),
            user: self.settings.user.clone(),
            network_disabled: Some(!self.settings.allow_network),
            host_config: Some(self.settings.host_config(workspace.path())),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;
        let guard = ContainerGuard {
            docker: self.docker.clone(),
            id: Some(container.id.clone()),
            _workspace: workspace,
        };

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await
        {
            guard.release().await;
            return Err(e.into());
        }
        Ok(guard)
    }
}

#[async_trait]
impl ProviderAdapter for ContainerRuntimeProvider {
    fn capabilities(&self) -> ProviderDescriptor {
        ProviderDescriptor::new(
            self.settings.name.clone(),
            ProviderKind::Container,
            self.settings.priority,
            BUILTIN_LANGUAGES.iter().copied(),
        )
    }

    async fn health_check(&self) -> HealthProbeResult {
        let start = Instant::now();
        match tokio::time::timeout(self.settings.probe_timeout, self.docker.ping()).await {
            Ok(Ok(_)) => HealthProbeResult {
                available: true,
                latency_ms: elapsed_ms(start),
            },
            Ok(Err(e)) => {
                log::debug!("Docker ping failed for '{}': {}", self.settings.name, e);
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
        let name = self.settings.name.as_str();
        let spec = self
            .settings
            .language_image(language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(language.to_string()))?;
        let timeout_secs = ctx.deadline.remaining_secs_ceil();

        let workspace = match prepare_workspace(&spec, request) {
            Ok(dir) => dir,
            Err(e) => {
                return Ok(ExecutionResult::provider_unavailable(
                    request,
                    language,
                    name,
                    format!("failed to prepare workspace: {}", e),
                ))
            }
        };

        // Until the container is running nothing user-supplied has executed,
        // so every failure here is an infrastructure failure.
        let container_name = format!("gola-exec-{}", Uuid::new_v4());
        let started = tokio::select! {
            r = self.create_and_start(&spec, &container_name, workspace, timeout_secs) => r,
            _ = ctx.expired() => {
                // The create call may have landed before it was abandoned.
                spawn_removal(&self.docker, container_name.clone());
                Err(ExecError::unavailable(name, "deadline reached before container start"))
            }
        };
        let guard = match started {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("[{}] Container provider unavailable: {}", request.request_id, e);
                return Ok(ExecutionResult::provider_unavailable(
                    request,
                    language,
                    name,
                    e.to_string(),
                ));
            }
        };
        let id = guard.id.clone().unwrap_or_default();
        log::debug!(
            "[{}] Started container {} ({}) with {}s budget",
            request.request_id,
            id,
            spec.image,
            timeout_secs
        );

        let start = Instant::now();
        let waited = tokio::select! {
            r = wait_for_exit(&self.docker, &id) => Some(r),
            _ = ctx.expired() => None,
        };

        let mut stdout = OutputCapture::new(self.settings.max_output_bytes);
        let mut stderr = OutputCapture::new(self.settings.max_output_bytes);
        let result = match waited {
            None => {
                log::warn!(
                    "[{}] Container {} hit its deadline, killing",
                    request.request_id,
                    id
                );
                let duration_ms = elapsed_ms(start);
                // Kill and log collection share one grace budget; whatever was
                // captured when it runs out is what gets reported.
                let teardown = async {
                    if let Err(e) = self
                        .docker
                        .kill_container(&id, None::<BollardKillContainerOptionsQuery>)
                        .await
                    {
                        log::debug!("Kill of container {} failed: {}", id, e);
                    }
                    collect_logs(&self.docker, &id, &mut stdout, &mut stderr).await;
                };
                if tokio::time::timeout(self.settings.teardown_grace, teardown)
                    .await
                    .is_err()
                {
                    log::warn!(
                        "[{}] Teardown of container {} exceeded {:?}",
                        request.request_id,
                        id,
                        self.settings.teardown_grace
                    );
                }
                ExecutionResult::timed_out(
                    request,
                    language,
                    name,
                    stdout.finish(),
                    stderr.finish(),
                    duration_ms,
                )
            }
            Some(Ok(exit_code)) => {
                let duration_ms = elapsed_ms(start);
                let _ = tokio::time::timeout(
                    self.settings.teardown_grace,
                    collect_logs(&self.docker, &id, &mut stdout, &mut stderr),
                )
                .await;
                let (stdout, stderr) = (stdout.finish(), stderr.finish());
                if killed_by_inner_timeout(exit_code, duration_ms, timeout_secs) {
                    ExecutionResult::timed_out(request, language, name, stdout, stderr, duration_ms)
                } else {
                    ExecutionResult::completed(
                        request,
                        language,
                        name,
                        stdout,
                        stderr,
                        exit_code,
                        duration_ms,
                    )
                }
            }
            Some(Err(e)) => {
                log::error!(
                    "[{}] Lost track of container {} after start: {}",
                    request.request_id,
                    id,
                    e
                );
                ExecutionResult::internal_error(request, language, e.to_string())
                    .with_provider(name)
                    .with_duration_ms(elapsed_ms(start))
            }
        };

        if result.outcome == Outcome::TimedOut {
            // Out of budget: removal finishes in the background.
            drop(guard);
        } else if tokio::time::timeout(self.settings.teardown_grace, guard.release())
            .await
            .is_err()
        {
            log::warn!("Removal of container {} still pending", id);
        }
        Ok(result)
    }
}

/// True when a SIGKILL exit lines up with the in-container `timeout` wrapper.
fn killed_by_inner_timeout(exit_code: i64, duration_ms: u64, timeout_secs: u64) -> bool {
    exit_code == SIGKILL_EXIT_CODE && duration_ms + 250 >= timeout_secs * 1000
}
