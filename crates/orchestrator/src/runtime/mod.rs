//! `ContainerRuntime` port: the only interface through which this crate
//! touches a container engine. `Provisioner` is the only caller.

pub mod docker;
pub mod fake;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::BollardRuntime;
pub use fake::FakeRuntime;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container runtime connection failed: {0}")]
    ConnectionFailed(String),
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("container creation failed: {0}")]
    CreateFailed(String),
    #[error("container runtime error: {0}")]
    Backend(#[from] bollard::errors::Error),
}

/// A container as observed by the runtime, independent of this crate's own
/// bookkeeping in `State` — used by `ReplicaValidator` to reconcile the two.
#[derive(Debug, Clone)]
pub struct ObservedContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub host_port: Option<u16>,
    /// Docker healthcheck status, when the image defines one. `None` means
    /// no healthcheck is configured, not that health is unknown.
    pub healthy: Option<bool>,
}

/// Parameters for creating one AceStream engine container.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub http_port: u16,
    pub labels: HashMap<String, String>,
    pub env: Vec<(String, String)>,
    pub network: Option<String>,
}

/// Single-sample resource usage, as returned by `ContainerRuntime::stats`.
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lists every container carrying the orchestrator's management label,
    /// running or not. Used by `ReplicaValidator::validate_and_sync`.
    async fn list_labelled(&self, label: &str) -> Result<Vec<ObservedContainer>, RuntimeError>;

    async fn create(&self, spec: CreateSpec) -> Result<String, RuntimeError>;

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, container_id: &str, timeout_secs: Option<u32>) -> Result<(), RuntimeError>;

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn inspect(&self, container_id: &str) -> Result<ObservedContainer, RuntimeError>;

    /// True when the daemon/engine is reachable at all — used to degrade
    /// `ReplicaValidator`'s status rather than fail it outright.
    async fn is_available(&self) -> bool;

    /// One-shot CPU/memory snapshot per container, for the stats collector
    /// background task. Missing ids are simply absent from the result map
    /// rather than causing the whole batch to fail.
    async fn stats(&self, ids: &[String]) -> HashMap<String, ContainerStats>;

    /// Runs `cmd` inside `container_id` to completion and waits for its exit
    /// code. Used by `Provisioner::clear_cache` for the disk-cache scrub.
    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<i64, RuntimeError>;
}
