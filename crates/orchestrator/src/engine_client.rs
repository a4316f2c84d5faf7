//! Outbound HTTP calls from the controller to engine containers: liveness,
//! VPN connectivity secondary check, and version/platform info. Each call
//! class gets its own timeout distinct from the client's general timeout.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineClientError {
    #[error("engine request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("engine returned an unexpected response")]
    UnexpectedResponse,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NetworkConnectionResponse {
    #[serde(default)]
    result: Option<NetworkConnectionResult>,
}

#[derive(Debug, Deserialize)]
struct NetworkConnectionResult {
    #[serde(default)]
    connected: bool,
}

pub struct EngineClient {
    http: Client,
}

impl Default for EngineClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineClient {
    pub fn new() -> Self {
        Self {
            http: Client::builder().build().expect("reqwest client builder"),
        }
    }

    fn base_url(host: &str, port: u16) -> String {
        format!("http://{host}:{port}")
    }

    /// `GET /server/api?api_version=3&method=get_status` — liveness, 3s timeout.
    pub async fn is_alive(&self, host: &str, port: u16) -> bool {
        let url = format!("{}/server/api?api_version=3&method=get_status", Self::base_url(host, port));
        match self.http.get(&url).timeout(Duration::from_secs(3)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// `GET /server/api?api_version=3&method=get_network_connection_status`
    /// — secondary VPN-connectivity check used when the VPN container's own
    /// health probe reports unhealthy. 3s timeout.
    pub async fn network_connected(&self, host: &str, port: u16) -> Result<bool, EngineClientError> {
        let url = format!(
            "{}/server/api?api_version=3&method=get_network_connection_status",
            Self::base_url(host, port)
        );
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await?
            .json::<NetworkConnectionResponse>()
            .await?;
        Ok(resp.result.map(|r| r.connected).unwrap_or(false))
    }

    /// `GET /webui/api/service?method=get_version` — platform/version, 5s timeout.
    pub async fn version(&self, host: &str, port: u16) -> Result<serde_json::Value, EngineClientError> {
        let url = format!("{}/webui/api/service?method=get_version", Self::base_url(host, port));
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .json::<StatusResponse>()
            .await?;
        resp.result.ok_or(EngineClientError::UnexpectedResponse)
    }
}
