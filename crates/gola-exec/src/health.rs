//! Provider health tracking
//!
//! The registry is the only long-lived mutable state in the service. It is an
//! eventually-consistent view fed by a periodic background prober and by real
//! execution attempts, and it is consulted on every request to move known-bad
//! providers to the back of the candidate list.
//!
//! Records sit in a map that is built once from the registered provider names and
//! never resized, with one lock per record. Writers hold a record lock only for a
//! field update; no I/O ever happens under a lock.

use crate::providers::ProviderAdapter;
use crate::types::{HealthProbeResult, ProviderDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub provider_name: String,
    pub last_checked_at: DateTime<Utc>,
    pub is_available: bool,
    pub last_latency_ms: u64,
    pub consecutive_failures: u32,
}

impl HealthRecord {
    fn new(provider_name: &str) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            last_checked_at: Utc::now(),
            is_available: true,
            last_latency_ms: 0,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug)]
pub struct HealthRegistry {
    slots: HashMap<String, RwLock<Option<HealthRecord>>>,
    failure_threshold: u32,
}

impl HealthRegistry {
    pub fn new<I, S>(provider_names: I, failure_threshold: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots = provider_names
            .into_iter()
            .map(|name| (name.into(), RwLock::new(None)))
            .collect();
        Self {
            slots,
            failure_threshold: failure_threshold.max(1),
        }
    }

    fn update(&self, provider_name: &str, apply: impl FnOnce(&mut HealthRecord)) {
        let Some(slot) = self.slots.get(provider_name) else {
            log::warn!("Health update for unregistered provider '{}' ignored", provider_name);
            return;
        };
        let mut guard = slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = guard.get_or_insert_with(|| HealthRecord::new(provider_name));
        apply(record);
        record.last_checked_at = Utc::now();
    }

    pub fn record_probe(&self, provider_name: &str, probe: HealthProbeResult) {
        if probe.available {
            self.record_success(provider_name, probe.latency_ms);
        } else {
            self.update(provider_name, |record| {
                record.is_available = false;
                record.last_latency_ms = probe.latency_ms;
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            });
        }
    }

    /// Called from the request path when an attempt came back `ProviderUnavailable`.
    pub fn record_unavailable(&self, provider_name: &str) {
        self.update(provider_name, |record| {
            record.is_available = false;
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        });
    }

    pub fn record_success(&self, provider_name: &str, latency_ms: u64) {
        self.update(provider_name, |record| {
            record.is_available = true;
            record.last_latency_ms = latency_ms;
            record.consecutive_failures = 0;
        });
    }

    pub fn get(&self, provider_name: &str) -> Option<HealthRecord> {
        self.slots
            .get(provider_name)
            .and_then(|slot| slot.read().unwrap_or_else(|p| p.into_inner()).clone())
    }

    pub fn snapshot(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = self
            .slots
            .values()
            .filter_map(|slot| slot.read().unwrap_or_else(|p| p.into_inner()).clone())
            .collect();
        records.sort_by(|a, b| a.provider_name.cmp(&b.provider_name));
        records
    }

    /// Providers never observed count as healthy.
    pub fn is_demoted(&self, provider_name: &str) -> bool {
        match self.get(provider_name) {
            Some(record) => {
                !record.is_available || record.consecutive_failures >= self.failure_threshold
            }
            None => false,
        }
    }

    /// Reorders candidates so demoted providers come last. The relative order
    /// inside each group is kept and no candidate is ever removed.
    pub fn rank(&self, mut candidates: Vec<ProviderDescriptor>) -> Vec<ProviderDescriptor> {
        candidates.sort_by_cached_key(|p| self.is_demoted(&p.name));
        candidates
    }
}

/// Periodic background probing of every provider.
pub struct HealthProber;

impl HealthProber {
    pub async fn probe_all(
        registry: &HealthRegistry,
        providers: &[Arc<dyn ProviderAdapter>],
        probe_timeout: Duration,
    ) {
        let probes = providers.iter().map(|provider| async move {
            let name = provider.capabilities().name;
            let probe = match tokio::time::timeout(probe_timeout, provider.health_check()).await {
                Ok(probe) => probe,
                Err(_) => HealthProbeResult::unavailable(probe_timeout.as_millis() as u64),
            };
            (name, probe)
        });

        for (name, probe) in futures_util::future::join_all(probes).await {
            if !probe.available {
                log::debug!("Health probe: provider '{}' unavailable", name);
            }
            registry.record_probe(&name, probe);
        }
    }

    /// Runs one sweep immediately and then one per `interval` until `shutdown` fires.
    pub fn spawn(
        registry: Arc<HealthRegistry>,
        providers: Vec<Arc<dyn ProviderAdapter>>,
        interval: Duration,
        probe_timeout: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            log::info!(
                "Health prober started for {} provider(s), interval {:?}",
                providers.len(),
                interval
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        Self::probe_all(&registry, &providers, probe_timeout).await;
                    }
                }
            }
            log::info!("Health prober stopped");
        })
    }
}
