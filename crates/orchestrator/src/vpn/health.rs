//! Per-VPN health sampling: ask the runtime adapter first; if it reports
//! unhealthy (or doesn't know), fall back to a secondary check against any
//! managed engine on that VPN's own network-connection status.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::engine_client::EngineClient;
use crate::runtime::ContainerRuntime;
use crate::state::SharedState;

pub struct VpnHealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    engine_client: Arc<EngineClient>,
    state: SharedState,
    /// Last-sampled health per VPN container id, for callers (e.g. the
    /// `/vpn/status` handler) that want the current reading without
    /// re-sampling.
    last_known: DashMap<String, bool>,
}

impl VpnHealthMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, engine_client: Arc<EngineClient>, state: SharedState) -> Self {
        Self {
            runtime,
            engine_client,
            state,
            last_known: DashMap::new(),
        }
    }

    /// Samples one VPN's health. `vpn_container_id` addresses the Gluetun
    /// container via the runtime; `vpn_key` is the logical id used to tag
    /// engines' `vpn_id` field (they may be the same string).
    pub async fn sample(&self, vpn_container_id: &str, vpn_key: &str) -> bool {
        let primary = self.runtime.inspect(vpn_container_id).await.ok().and_then(|c| c.healthy);

        let healthy = match primary {
            Some(true) => true,
            Some(false) | None => {
                debug!(vpn_container_id, "primary health check inconclusive, trying secondary check via engines");
                self.secondary_check(vpn_key).await
            }
        };

        if healthy {
            self.state.record_vpn_healthy(vpn_key);
        } else {
            self.state.record_vpn_unhealthy(vpn_key);
            warn!(vpn_key, "vpn reported unhealthy by both primary and secondary checks");
        }
        self.last_known.insert(vpn_container_id.to_string(), healthy);
        healthy
    }

    /// Asks any managed engine on this VPN for its own network-connection
    /// status; a single connected engine is enough to call the VPN healthy.
    async fn secondary_check(&self, vpn_key: &str) -> bool {
        let engines = self.state.engines_by_vpn(vpn_key);
        for engine in engines {
            if let Ok(true) = self.engine_client.network_connected(&engine.host, engine.http_port).await {
                return true;
            }
        }
        false
    }

    pub fn last_known(&self, vpn_container_id: &str) -> Option<bool> {
        self.last_known.get(vpn_container_id).map(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeRuntime;
    use crate::state::State;

    fn monitor() -> (VpnHealthMonitor, Arc<FakeRuntime>, SharedState) {
        let runtime = Arc::new(FakeRuntime::new());
        let engine_client = Arc::new(EngineClient::new());
        let state = Arc::new(State::new(true));
        let monitor = VpnHealthMonitor::new(runtime.clone(), engine_client, state.clone());
        (monitor, runtime, state)
    }

    #[tokio::test]
    async fn primary_healthy_short_circuits_secondary_check() {
        let (monitor, runtime, _state) = monitor();
        runtime
            .create(crate::runtime::CreateSpec {
                name: "vpn-a".to_string(),
                image: "gluetun".to_string(),
                http_port: 0,
                labels: Default::default(),
                env: Vec::new(),
                network: None,
            })
            .await
            .unwrap();
        runtime.set_container_health("fake-0", Some(true)).await;

        assert!(monitor.sample("fake-0", "vpnA").await);
        assert_eq!(monitor.last_known("fake-0"), Some(true));
    }

    #[tokio::test]
    async fn primary_unhealthy_and_no_engines_reports_unhealthy() {
        let (monitor, runtime, _state) = monitor();
        runtime
            .create(crate::runtime::CreateSpec {
                name: "vpn-a".to_string(),
                image: "gluetun".to_string(),
                http_port: 0,
                labels: Default::default(),
                env: Vec::new(),
                network: None,
            })
            .await
            .unwrap();
        runtime.set_container_health("fake-0", Some(false)).await;

        assert!(!monitor.sample("fake-0", "vpnA").await);
    }
}
