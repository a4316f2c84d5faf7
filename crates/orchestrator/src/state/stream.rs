use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Started,
    Ended,
}

/// A media session served by one engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub container_id: String,
    pub key_type: String,
    pub key: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: StreamStatus,
}

/// Inbound `/events/stream_started` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamStartedEvent {
    pub stream_id: Option<String>,
    pub container_id: String,
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub key: String,
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
}

/// Inbound `/events/stream_ended` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEndedEvent {
    pub stream_id: Option<String>,
    pub container_id: Option<String>,
}
