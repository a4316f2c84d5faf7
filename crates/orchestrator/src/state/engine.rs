use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health as last observed by the monitor loop or a VPN secondary check.
/// Not a liveness probe result for the HTTP API itself — see `EngineClient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Unknown,
    Healthy,
    Unhealthy,
}

impl Default for Health {
    fn default() -> Self {
        Health::Unknown
    }
}

/// One AceStream container managed by this orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub id: String,
    pub name: String,
    pub host: String,
    pub http_port: u16,
    pub labels: HashMap<String, String>,
    pub vpn_id: Option<String>,
    pub forwarded: bool,
    pub streams: Vec<String>,
    pub health: Health,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_stream_usage: DateTime<Utc>,
}

impl Engine {
    pub fn new(id: impl Into<String>, name: impl Into<String>, host: impl Into<String>, http_port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            host: host.into(),
            http_port,
            labels: HashMap::new(),
            vpn_id: None,
            forwarded: false,
            streams: Vec::new(),
            health: Health::Unknown,
            first_seen: now,
            last_seen: now,
            last_stream_usage: now,
        }
    }

    pub fn is_free(&self) -> bool {
        self.streams.is_empty()
    }
}
