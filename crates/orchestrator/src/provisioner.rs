//! The only path allowed to create or destroy engine containers. Owns the
//! `PortAllocator` so port reservation and container lifecycle change
//! together (I6: a port is released iff its container was stopped here).

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::port_allocator::PortAllocator;
use crate::runtime::{ContainerRuntime, CreateSpec, ObservedContainer, RuntimeError};
use crate::state::{Engine, SharedState};
use crate::validator::MANAGED_LABEL;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("no ports available")]
    PortsExhausted,
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub vpn_id: Option<String>,
    pub network: Option<String>,
    pub forwarded: bool,
}

#[derive(Debug, Clone)]
pub struct ProvisionResponse {
    pub container_id: String,
    pub host_http_port: u16,
}

pub struct Provisioner {
    state: SharedState,
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    image: String,
}

impl Provisioner {
    pub fn new(state: SharedState, runtime: Arc<dyn ContainerRuntime>, ports: PortAllocator, image: String) -> Self {
        Self {
            state,
            runtime,
            ports,
            image,
        }
    }

    pub async fn start_engine(&self, req: ProvisionRequest) -> Result<ProvisionResponse, ProvisionError> {
        let port = if req.forwarded {
            self.ports.allocate_forwarded().map_err(|_| ProvisionError::PortsExhausted)?
        } else {
            self.ports.allocate_regular().map_err(|_| ProvisionError::PortsExhausted)?
        };

        let name = format!("acestream-engine-{}", Uuid::new_v4());
        let mut labels = HashMap::new();
        labels.insert("managed".to_string(), "true".to_string());
        labels.insert("host.http_port".to_string(), port.to_string());
        if req.forwarded {
            labels.insert("forwarded".to_string(), "true".to_string());
        }
        if let Some(vpn) = &req.vpn_id {
            labels.insert("vpn_id".to_string(), vpn.clone());
        }

        let spec = CreateSpec {
            name: name.clone(),
            image: self.image.clone(),
            http_port: port,
            labels: labels.clone(),
            env: Vec::new(),
            network: req.network.clone(),
        };

        let result = self.runtime.create(spec).await;
        let container_id = match result {
            Ok(id) => id,
            Err(e) => {
                self.ports.release(port);
                return Err(ProvisionError::Runtime(e));
            }
        };

        let mut engine = Engine::new(container_id.clone(), name, String::new(), port);
        engine.labels = labels;
        engine.vpn_id = req.vpn_id;
        engine.forwarded = req.forwarded;
        self.state.upsert_engine(engine);

        info!(container_id, port, "started engine");
        Ok(ProvisionResponse {
            container_id,
            host_http_port: port,
        })
    }

    /// Stops and removes the container, then releases its port — **the
    /// only** place a port is released (I6). Callers must never stop a
    /// managed container through the runtime directly.
    pub async fn stop_engine(&self, container_id: &str) -> Result<(), ProvisionError> {
        let port = self.state.get_engine(container_id).map(|e| e.http_port);
        self.stop_container(container_id).await?;

        if let Some(port) = port {
            self.ports.release(port);
        }
        self.state.remove_engine(container_id);

        info!(container_id, "stopped engine");
        Ok(())
    }

    /// Same as `stop_engine`, but for a container already removed from
    /// `State` by the caller (e.g. `enter_emergency_mode`'s teardown) —
    /// the port to release is supplied directly rather than looked up,
    /// since a `State` lookup at this point would find nothing and the
    /// port would leak (I6).
    pub async fn stop_engine_with_known_port(&self, container_id: &str, http_port: u16) -> Result<(), ProvisionError> {
        self.stop_container(container_id).await?;
        self.ports.release(http_port);
        self.state.remove_engine(container_id);

        info!(container_id, http_port, "stopped engine (already removed from state)");
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), ProvisionError> {
        if let Err(e) = self.runtime.stop(container_id, Some(10)).await {
            warn!(container_id, error = %e, "stop failed, attempting remove anyway");
        }
        self.runtime.remove(container_id, true).await?;
        Ok(())
    }

    /// Enumerates labelled containers and rebuilds `State` entries for any
    /// not already present, re-reserving their ports. Idempotent: running
    /// it twice back to back leaves `State` unchanged the second time.
    pub async fn reindex(&self) -> Result<usize, ProvisionError> {
        let observed = self.runtime.list_labelled(MANAGED_LABEL).await?;
        Ok(self.reconcile_from_observed(&observed))
    }

    /// Same reconciliation `reindex` performs, against an already-fetched
    /// observation set. Lets a caller that has just queried the runtime for
    /// its own purposes (e.g. `ReplicaValidator::validate_and_sync`) route
    /// its rehydration through the one path that also re-reserves ports,
    /// instead of paying for a second `list_labelled` round trip.
    pub fn reconcile_from_observed(&self, observed: &[ObservedContainer]) -> usize {
        let mut added = 0;

        for container in observed.iter().filter(|c| c.running) {
            if self.state.get_engine(&container.id).is_some() {
                continue;
            }

            let port = container
                .labels
                .get("host.http_port")
                .and_then(|p| p.parse::<u16>().ok())
                .or(container.host_port);

            let forwarded = container.labels.get("forwarded").map(|v| v == "true").unwrap_or(false);

            let mut engine = Engine::new(container.id.clone(), container.name.clone(), String::new(), port.unwrap_or(0));
            engine.labels = container.labels.clone();
            engine.vpn_id = container.labels.get("vpn_id").cloned();
            engine.forwarded = forwarded;
            self.state.upsert_engine(engine);

            if let Some(port) = port {
                self.ports.mark_in_use(port, forwarded);
            }
            added += 1;
        }

        let running_ids: std::collections::HashSet<String> = observed.iter().filter(|c| c.running).map(|c| c.id.clone()).collect();
        for engine in self.state.list_engines() {
            if !running_ids.contains(&engine.id) {
                self.state.remove_engine(&engine.id);
            }
        }

        added
    }

    /// Reserved port count across both pools; used by callers that report
    /// fleet capacity and by tests asserting no leak across a stop path.
    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use_count()
    }

    /// Best-effort disk-cache scrub for an idle engine; not fatal if the
    /// runtime can't exec into the container (e.g. it is already gone).
    /// Optional disk-cache scrub for an idle engine: runs the engine
    /// image's cache-clear command in-container via the runtime's `exec`.
    /// Best-effort — a missing container or nonzero exit is logged, not
    /// propagated, since the engine may already be gone by the time this
    /// runs.
    pub async fn clear_cache(&self, container_id: &str) -> Result<(), ProvisionError> {
        let cmd = vec!["rm".to_string(), "-rf".to_string(), "/home/user/.ACEStream/.acestream_cache".to_string()];
        match self.runtime.exec(container_id, cmd).await {
            Ok(0) => {
                info!(container_id, "cache scrub completed");
                Ok(())
            }
            Ok(code) => {
                warn!(container_id, exit_code = code, "cache scrub command exited non-zero");
                Ok(())
            }
            Err(e) => {
                warn!(container_id, error = %e, "cache scrub skipped, container not found");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeRuntime;
    use crate::state::State;

    fn provisioner() -> (Provisioner, Arc<FakeRuntime>, SharedState) {
        let state = Arc::new(State::new(false));
        let runtime = Arc::new(FakeRuntime::new());
        let ports = PortAllocator::new(6000..=6010, 7000..=7000);
        let provisioner = Provisioner::new(state.clone(), runtime.clone(), ports, "acestream/engine".to_string());
        (provisioner, runtime, state)
    }

    #[tokio::test]
    async fn start_then_stop_releases_port_for_reuse() {
        let (provisioner, _rt, state) = provisioner();
        let resp = provisioner.start_engine(ProvisionRequest::default()).await.unwrap();
        assert!(state.get_engine(&resp.container_id).is_some());

        provisioner.stop_engine(&resp.container_id).await.unwrap();
        assert!(state.get_engine(&resp.container_id).is_none());

        // Port should be free again: exhaust the range and confirm we get it back.
        for _ in 0..10 {
            provisioner.start_engine(ProvisionRequest::default()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn clear_cache_execs_into_the_container() {
        let (provisioner, rt, _state) = provisioner();
        let resp = provisioner.start_engine(ProvisionRequest::default()).await.unwrap();

        provisioner.clear_cache(&resp.container_id).await.unwrap();

        let log = rt.exec_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, resp.container_id);
    }

    #[tokio::test]
    async fn clear_cache_on_missing_container_is_not_an_error() {
        let (provisioner, _rt, _state) = provisioner();
        assert!(provisioner.clear_cache("nope").await.is_ok());
    }

    #[tokio::test]
    async fn ports_exhausted_after_range_is_consumed() {
        let (provisioner, _rt, _state) = provisioner();
        for _ in 0..11 {
            provisioner.start_engine(ProvisionRequest::default()).await.unwrap();
        }
        let result = provisioner.start_engine(ProvisionRequest::default()).await;
        assert!(matches!(result, Err(ProvisionError::PortsExhausted)));
    }

    #[tokio::test]
    async fn reindex_is_idempotent() {
        let (provisioner, rt, state) = provisioner();
        // Simulate a container the runtime knows about but State doesn't
        // (e.g. left over from a previous process lifetime).
        rt.create(CreateSpec {
            name: "orphan".to_string(),
            image: "acestream/engine".to_string(),
            http_port: 6878,
            labels: HashMap::from([("managed".to_string(), "true".to_string())]),
            env: Vec::new(),
            network: None,
        })
        .await
        .unwrap();

        let first = provisioner.reindex().await.unwrap();
        let second = provisioner.reindex().await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(state.list_engines().len(), 1);
    }
}
