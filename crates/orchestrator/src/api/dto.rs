//! Response shapes for the HTTP surface. `OrchestratorStatus` has a fixed,
//! bit-exact shape that downstream consumers depend on; the rest follow the
//! `serde_json::json!` convention only where a plain struct buys nothing —
//! otherwise they're typed like everything else in this crate.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::BlockedReasonDetails;
use crate::runtime::ContainerStats;
use crate::state::{Engine, Health, Stream};

#[derive(Debug, Clone, Serialize)]
pub struct EngineDto {
    pub id: String,
    pub name: String,
    pub host: String,
    pub http_port: u16,
    pub vpn_id: Option<String>,
    pub forwarded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_port: Option<u16>,
    pub health: Health,
    pub stream_count: usize,
    pub streams: Vec<String>,
    /// Passively populated from container labels during Reindex — this
    /// handler never makes a live outbound call per engine (API
    /// handlers read `State` and return).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Latest batch sample from the background stats collector; absent
    /// until the first poll after the engine was provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
}

impl EngineDto {
    /// Overlays the latest cached resource sample, if any, onto an
    /// already-built DTO. Kept separate from `From<Engine>` since stats
    /// live in `StatsCollector`'s cache, not on `Engine` itself.
    pub fn with_stats(mut self, stats: Option<ContainerStats>) -> Self {
        if let Some(stats) = stats {
            self.cpu_percent = Some(stats.cpu_percent);
            self.memory_usage_bytes = Some(stats.memory_usage_bytes);
            self.memory_limit_bytes = Some(stats.memory_limit_bytes);
        }
        self
    }
}

impl From<Engine> for EngineDto {
    fn from(e: Engine) -> Self {
        Self {
            forwarded_port: e.forwarded.then_some(e.http_port),
            platform: e.labels.get("platform").cloned(),
            version: e.labels.get("version").cloned(),
            stream_count: e.streams.len(),
            id: e.id,
            name: e.name,
            host: e.host,
            http_port: e.http_port,
            vpn_id: e.vpn_id,
            forwarded: e.forwarded,
            streams: e.streams,
            health: e.health,
            first_seen: e.first_seen,
            last_seen: e.last_seen,
            cpu_percent: None,
            memory_usage_bytes: None,
            memory_limit_bytes: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EngineWithStreams {
    #[serde(flatten)]
    pub engine: EngineDto,
    pub stream_details: Vec<Stream>,
}

#[derive(Debug, Serialize)]
pub struct EngineCounts {
    pub total: usize,
    pub running: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

#[derive(Debug, Serialize)]
pub struct StreamCounts {
    pub active: usize,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct CapacityStatus {
    pub total: usize,
    pub used: usize,
    pub available: usize,
    pub max_replicas: usize,
    pub min_replicas: usize,
}

#[derive(Debug, Serialize)]
pub struct VpnStatusSummary {
    pub enabled: bool,
    pub connected: bool,
    pub health: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_port: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct ProvisioningStatus {
    pub can_provision: bool,
    pub circuit_breaker_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason_details: Option<BlockedReasonDetails>,
}

/// `GET /orchestrator/status` response — normative shape, consumers depend
/// on the field names and nesting matching exactly.
#[derive(Debug, Serialize)]
pub struct OrchestratorStatus {
    pub status: String,
    pub engines: EngineCounts,
    pub streams: StreamCounts,
    pub capacity: CapacityStatus,
    pub vpn: VpnStatusSummary,
    pub provisioning: ProvisioningStatus,
    pub timestamp: DateTime<Utc>,
}
