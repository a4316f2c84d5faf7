//! Deterministic in-memory `ContainerRuntime` used by every test in this
//! crate that doesn't need a real Docker daemon.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ContainerRuntime, ContainerStats, CreateSpec, ObservedContainer, RuntimeError};

#[derive(Default)]
struct Inner {
    containers: HashMap<String, ObservedContainer>,
    available: bool,
    /// Container ids the next `create` call should fail for, to exercise
    /// the autoscaler's partial-failure batch handling.
    fail_create_for: Vec<String>,
    /// Commands passed to `exec`, recorded for assertions in cache-scrub
    /// tests rather than actually run anywhere.
    exec_log: Vec<(String, Vec<String>)>,
}

pub struct FakeRuntime {
    inner: Mutex<Inner>,
    counter: AtomicU64,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                available: true,
                ..Default::default()
            }),
            counter: AtomicU64::new(0),
        }
    }

    pub async fn seed(&self, container: ObservedContainer) {
        self.inner.lock().await.containers.insert(container.id.clone(), container);
    }

    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.available = available;
    }

    /// The next `create()` call whose spec name is in `names` returns
    /// `RuntimeError::CreateFailed`, then is removed from this list.
    pub async fn fail_next_create(&self, names: Vec<String>) {
        self.inner.lock().await.fail_create_for = names;
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.containers.len()
    }

    /// Sets a container's reported Docker healthcheck status, for exercising
    /// `VpnHealthMonitor`'s primary-check path without a real daemon.
    pub async fn set_container_health(&self, container_id: &str, healthy: Option<bool>) {
        if let Some(c) = self.inner.lock().await.containers.get_mut(container_id) {
            c.healthy = healthy;
        }
    }

    pub async fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.inner.lock().await.exec_log.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_labelled(&self, label: &str) -> Result<Vec<ObservedContainer>, RuntimeError> {
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        let inner = self.inner.lock().await;
        Ok(inner
            .containers
            .values()
            .filter(|c| c.labels.get(key).map(|v| v.as_str()) == Some(value) || value.is_empty())
            .cloned()
            .collect())
    }

    async fn create(&self, spec: CreateSpec) -> Result<String, RuntimeError> {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.fail_create_for.iter().position(|n| n == &spec.name) {
            inner.fail_create_for.remove(pos);
            return Err(RuntimeError::CreateFailed(format!("forced failure for {}", spec.name)));
        }

        let id = format!("fake-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        inner.containers.insert(
            id.clone(),
            ObservedContainer {
                id: id.clone(),
                name: spec.name,
                running: true,
                labels: spec.labels,
                host_port: Some(spec.http_port),
                healthy: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;
        let c = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        c.running = true;
        Ok(())
    }

    async fn stop(&self, container_id: &str, _timeout_secs: Option<u32>) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;
        let c = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        c.running = false;
        Ok(())
    }

    async fn remove(&self, container_id: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;
        inner
            .containers
            .remove(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ObservedContainer, RuntimeError> {
        let inner = self.inner.lock().await;
        inner
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))
    }

    async fn is_available(&self) -> bool {
        self.inner.lock().await.available
    }

    async fn stats(&self, ids: &[String]) -> HashMap<String, ContainerStats> {
        let inner = self.inner.lock().await;
        ids.iter()
            .filter(|id| inner.containers.contains_key(id.as_str()))
            .map(|id| {
                (
                    id.clone(),
                    ContainerStats {
                        cpu_percent: 0.0,
                        memory_usage_bytes: 0,
                        memory_limit_bytes: 0,
                    },
                )
            })
            .collect()
    }

    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<i64, RuntimeError> {
        let mut inner = self.inner.lock().await;
        if !inner.containers.contains_key(container_id) {
            return Err(RuntimeError::ContainerNotFound(container_id.to_string()));
        }
        inner.exec_log.push((container_id.to_string(), cmd));
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> CreateSpec {
        CreateSpec {
            name: name.to_string(),
            image: "acestream/engine".to_string(),
            http_port: 6878,
            labels: HashMap::new(),
            env: Vec::new(),
            network: None,
        }
    }

    #[tokio::test]
    async fn create_then_inspect_round_trips() {
        let rt = FakeRuntime::new();
        let id = rt.create(spec("e1")).await.unwrap();
        let observed = rt.inspect(&id).await.unwrap();
        assert!(observed.running);
        assert_eq!(observed.name, "e1");
    }

    #[tokio::test]
    async fn forced_create_failure_is_one_shot() {
        let rt = FakeRuntime::new();
        rt.fail_next_create(vec!["e1".to_string()]).await;
        assert!(rt.create(spec("e1")).await.is_err());
        assert!(rt.create(spec("e1")).await.is_ok());
    }

    #[tokio::test]
    async fn stop_and_remove_unknown_container_errors() {
        let rt = FakeRuntime::new();
        assert!(rt.stop("nope", None).await.is_err());
        assert!(rt.remove("nope", true).await.is_err());
    }

    #[tokio::test]
    async fn stats_only_returns_known_containers() {
        let rt = FakeRuntime::new();
        let id = rt.create(spec("e1")).await.unwrap();
        let stats = rt.stats(&[id.clone(), "nope".to_string()]).await;
        assert_eq!(stats.len(), 1);
        assert!(stats.contains_key(&id));
    }

    #[tokio::test]
    async fn exec_on_known_container_is_logged() {
        let rt = FakeRuntime::new();
        let id = rt.create(spec("e1")).await.unwrap();
        let exit_code = rt.exec(&id, vec!["rm".to_string()]).await.unwrap();
        assert_eq!(exit_code, 0);
        assert_eq!(rt.exec_log().await.len(), 1);
    }
}
