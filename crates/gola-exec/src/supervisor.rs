//! Execution orchestration: routing, health-aware ordering and fallback
//!
//! The supervisor is the only component that enforces deadlines. A request gets
//! one overall budget; candidates are attempted strictly one at a time in ranked
//! order, each with whatever budget is left. Fallback only happens when an
//! attempt reports `ProviderUnavailable`, i.e. the code never ran. Once any
//! provider has actually run the code its result is final, so untrusted code is
//! executed at most once per request.

use crate::deadline::{Deadline, ExecContext};
use crate::errors::ExecError;
use crate::health::{HealthRecord, HealthRegistry};
use crate::providers::{elapsed_ms, ProviderAdapter};
use crate::router::LanguageRouter;
use crate::types::{CapturedOutput, ExecutionRequest, ExecutionResult, Outcome};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Time an adapter has after cancellation to tear down and report what it captured.
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_millis(1500);

/// Extra wait on top of the teardown grace before an attempt task is aborted.
/// Adapters bound their own teardown by the grace, so only an adapter that
/// ignores cancellation runs into this.
pub const ABORT_MARGIN: Duration = Duration::from_millis(500);

pub struct ExecutionSupervisor {
    router: LanguageRouter,
    registry: Arc<HealthRegistry>,
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    teardown_grace: Duration,
}

impl ExecutionSupervisor {
    pub fn new(providers: Vec<Arc<dyn ProviderAdapter>>, registry: Arc<HealthRegistry>) -> Self {
        let descriptors = providers.iter().map(|p| p.capabilities()).collect();
        let mut by_name = HashMap::new();
        for provider in providers {
            let name = provider.capabilities().name;
            if by_name.insert(name.clone(), provider).is_some() {
                log::warn!("Provider '{}' registered twice; keeping the last one", name);
            }
        }
        Self {
            router: LanguageRouter::new(descriptors),
            registry,
            providers: by_name,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
        }
    }

    pub fn with_aliases(mut self, aliases: &HashMap<String, String>) -> Self {
        self.router = self.router.with_aliases(aliases);
        self
    }

    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    pub fn router(&self) -> &LanguageRouter {
        &self.router
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    pub fn languages(&self) -> BTreeSet<String> {
        self.router.languages()
    }

    pub fn health_snapshot(&self) -> Vec<HealthRecord> {
        self.registry.snapshot()
    }

    /// Runs a request to a terminal result. Never fails: every failure mode is
    /// expressed through `ExecutionResult::outcome`.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let deadline = Deadline::after(Duration::from_secs(request.timeout_seconds()));
        self.execute_within(request, deadline).await
    }

    pub async fn execute_within(
        &self,
        request: ExecutionRequest,
        deadline: Deadline,
    ) -> ExecutionResult {
        log::info!(
            "[{}] Received {} request ({} bytes, {}s budget)",
            request.request_id,
            request.language,
            request.source.len(),
            request.timeout_seconds()
        );

        let (language, candidates) = match self.router.resolve(&request.language) {
            Ok(resolved) => resolved,
            Err(e) => {
                log::warn!("[{}] {}", request.request_id, e);
                return ExecutionResult::internal_error(&request, &request.language, e.to_string());
            }
        };

        let ranked = self.registry.rank(candidates);
        log::debug!(
            "[{}] Candidates for {}: {:?}",
            request.request_id,
            language,
            ranked.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()
        );

        let mut failures = Vec::new();
        for descriptor in ranked {
            if deadline.is_expired() {
                log::warn!(
                    "[{}] Budget exhausted before trying '{}'",
                    request.request_id,
                    descriptor.name
                );
                failures.push(format!("{}: not attempted, budget exhausted", descriptor.name));
                break;
            }
            let Some(adapter) = self.providers.get(&descriptor.name).cloned() else {
                log::error!(
                    "[{}] Router returned unknown provider '{}'",
                    request.request_id,
                    descriptor.name
                );
                continue;
            };

            let attempt_start = Instant::now();
            let result = self
                .attempt(adapter, &descriptor.name, &language, &request, deadline)
                .await;

            match result.outcome {
                Outcome::ProviderUnavailable => {
                    let reason = result.error.clone().unwrap_or_default();
                    log::warn!(
                        "[{}] Provider '{}' unavailable ({}), {:?} budget left",
                        request.request_id,
                        descriptor.name,
                        reason,
                        deadline.remaining()
                    );
                    self.registry.record_unavailable(&descriptor.name);
                    failures.push(format!("{}: {}", descriptor.name, reason));
                }
                outcome => {
                    if matches!(outcome, Outcome::Completed | Outcome::TimedOut) {
                        self.registry
                            .record_success(&descriptor.name, elapsed_ms(attempt_start));
                    }
                    log::info!(
                        "[{}] Provider '{}' finished with {} in {}ms",
                        request.request_id,
                        descriptor.name,
                        outcome,
                        result.duration_ms
                    );
                    return result.normalized();
                }
            }
        }

        log::warn!(
            "[{}] All providers exhausted for {}",
            request.request_id,
            language
        );
        ExecutionResult::all_providers_exhausted(&request, &language, failures.join("; "))
    }

    /// One provider attempt, run in its own task so a panicking adapter cannot
    /// take the caller down and an unresponsive one can be aborted.
    async fn attempt(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        provider_name: &str,
        language: &str,
        request: &ExecutionRequest,
        deadline: Deadline,
    ) -> ExecutionResult {
        let start = Instant::now();
        let ctx = ExecContext::new(request.request_id.clone(), deadline);
        let cancel = ctx.cancel.clone();
        let task_language = language.to_string();
        let task_request = request.clone();

        let mut handle = tokio::spawn(async move {
            adapter.execute(&ctx, &task_language, &task_request).await
        });

        let finished = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = tokio::time::sleep_until(deadline.instant()) => None,
        };

        let joined = match finished {
            Some(joined) => joined,
            None => {
                cancel.cancel();
                let patience = self.teardown_grace + ABORT_MARGIN;
                match tokio::time::timeout(patience, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        log::error!(
                            "[{}] Provider '{}' ignored cancellation for {:?}, aborting",
                            request.request_id,
                            provider_name,
                            patience
                        );
                        handle.abort();
                        return ExecutionResult::timed_out(
                            request,
                            language,
                            provider_name,
                            CapturedOutput::default(),
                            CapturedOutput::default(),
                            elapsed_ms(start),
                        )
                        .with_error("provider did not honour cancellation");
                    }
                }
            }
        };

        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(ExecError::ProviderUnavailable { message, .. })) => {
                ExecutionResult::provider_unavailable(request, language, provider_name, message)
                    .with_duration_ms(elapsed_ms(start))
            }
            Ok(Err(e)) => {
                log::error!(
                    "[{}] Provider '{}' failed internally for {}: {:?}",
                    request.request_id,
                    provider_name,
                    language,
                    e
                );
                ExecutionResult::internal_error(request, language, e.to_string())
                    .with_provider(provider_name)
                    .with_duration_ms(elapsed_ms(start))
            }
            Err(join_error) => {
                log::error!(
                    "[{}] Provider '{}' task failed: {}",
                    request.request_id,
                    provider_name,
                    join_error
                );
                ExecutionResult::internal_error(
                    request,
                    language,
                    format!("provider task failed: {}", join_error),
                )
                .with_provider(provider_name)
                .with_duration_ms(elapsed_ms(start))
            }
        }
    }
}
