//! Redundant-mode Emergency/Recovery state machine. Single-VPN mode
//! has no FSM — the health monitor's `healthy` flag is exposed directly.
//!
//! `NORMAL -> EMERGENCY(failed) -> RECOVERY(target=failed) -> NORMAL`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::event_sink::{EventSink, OrchestratorEvent};
use crate::provisioner::Provisioner;
use crate::state::SharedState;

pub struct EmergencyModeFsm {
    state: SharedState,
    provisioner: Arc<Provisioner>,
    events: Arc<dyn EventSink>,
    vpn_a: String,
    vpn_b: String,
    stabilization_window: Duration,
}

impl EmergencyModeFsm {
    pub fn new(state: SharedState, provisioner: Arc<Provisioner>, events: Arc<dyn EventSink>, vpn_a: String, vpn_b: String, stabilization_window: Duration) -> Self {
        Self {
            state,
            provisioner,
            events,
            vpn_a,
            vpn_b,
            stabilization_window,
        }
    }

    fn other(&self, vpn: &str) -> String {
        if vpn == self.vpn_a {
            self.vpn_b.clone()
        } else {
            self.vpn_a.clone()
        }
    }

    /// One FSM step given the latest health sample for each VPN.
    pub async fn tick(&self, health_a: bool, health_b: bool) {
        if self.state.is_emergency_mode() {
            self.tick_emergency(health_a, health_b).await;
        } else if self.state.is_vpn_recovery_mode() {
            self.tick_recovery().await;
        } else {
            self.tick_normal(health_a, health_b).await;
        }
    }

    /// `NORMAL -> EMERGENCY`: exactly one VPN unhealthy (XOR). Both healthy
    /// or both unhealthy stays NORMAL — the latter has no safe failover
    /// target.
    async fn tick_normal(&self, health_a: bool, health_b: bool) {
        let failed_vpn = match (health_a, health_b) {
            (true, false) => Some(self.vpn_b.clone()),
            (false, true) => Some(self.vpn_a.clone()),
            _ => None,
        };

        let Some(failed_vpn) = failed_vpn else { return };
        let healthy_vpn = self.other(&failed_vpn);

        if let Some(removed) = self.state.enter_emergency_mode(&failed_vpn, &healthy_vpn) {
            warn!(failed_vpn, healthy_vpn, removed = removed.len(), "NORMAL -> EMERGENCY");
            self.events.record(OrchestratorEvent::EmergencyModeEntered {
                failed_vpn: failed_vpn.clone(),
                healthy_vpn,
            });
            for (id, port) in removed {
                if let Err(e) = self.provisioner.stop_engine_with_known_port(&id, port).await {
                    warn!(engine_id = id, error = %e, "failed to tear down engine on failed vpn");
                }
            }
        }
    }

    /// `EMERGENCY -> RECOVERY`: the failed VPN reports healthy again.
    async fn tick_emergency(&self, health_a: bool, health_b: bool) {
        let info = self.state.emergency_mode_info();
        let Some(failed_vpn) = info.failed_vpn else { return };
        let failed_healthy = if failed_vpn == self.vpn_a { health_a } else { health_b };

        if failed_healthy {
            self.state.exit_emergency_mode();
            self.events.record(OrchestratorEvent::EmergencyModeExited);
            if self.state.enter_vpn_recovery_mode(&failed_vpn) {
                self.state.set_vpn_stabilization_until(&failed_vpn, Utc::now() + chrono::Duration::from_std(self.stabilization_window).unwrap_or_default());
                info!(target_vpn = failed_vpn, "EMERGENCY -> RECOVERY");
                self.events.record(OrchestratorEvent::VpnRecoveryEntered { target_vpn: failed_vpn });
            }
        }
    }

    /// `RECOVERY -> NORMAL`: per-VPN engine counts differ by at most one,
    /// or the stabilization window elapses regardless.
    async fn tick_recovery(&self) {
        let Some(target) = self.state.vpn_recovery_target() else { return };
        let other = self.other(&target);

        let count_target = self.state.engines_by_vpn(&target).len();
        let count_other = self.state.engines_by_vpn(&other).len();
        let parity = count_target.abs_diff(count_other) <= 1;

        let stabilized = self
            .state
            .vpn_health(&target)
            .recovery_stabilization_until
            .map(|until| Utc::now() >= until)
            .unwrap_or(false);

        if parity || stabilized {
            self.state.exit_vpn_recovery_mode();
            info!(target_vpn = target, parity, stabilized, "RECOVERY -> NORMAL");
            self.events.record(OrchestratorEvent::VpnRecoveryExited);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sink::TracingEventSink;
    use crate::port_allocator::PortAllocator;
    use crate::runtime::FakeRuntime;
    use crate::state::{Engine, State};

    fn fsm() -> (EmergencyModeFsm, SharedState, Arc<Provisioner>) {
        let state = Arc::new(State::new(true));
        let runtime = Arc::new(FakeRuntime::new());
        let ports = PortAllocator::new(6000..=6100, 7000..=7000);
        let provisioner = Arc::new(Provisioner::new(state.clone(), runtime, ports, "acestream/engine".to_string()));
        let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);
        let fsm = EmergencyModeFsm::new(state.clone(), provisioner.clone(), events, "vpnA".to_string(), "vpnB".to_string(), Duration::from_secs(60));
        (fsm, state, provisioner)
    }

    #[tokio::test]
    async fn xor_unhealthy_enters_emergency_mode() {
        let (fsm, state, _prov) = fsm();
        let mut a1 = Engine::new("a1", "a1", "h", 1);
        a1.vpn_id = Some("vpnA".to_string());
        let mut b1 = Engine::new("b1", "b1", "h", 2);
        b1.vpn_id = Some("vpnB".to_string());
        state.upsert_engine(a1);
        state.upsert_engine(b1);

        fsm.tick(true, false).await;

        assert!(state.is_emergency_mode());
        assert!(state.get_engine("b1").is_none());
        assert!(state.get_engine("a1").is_some());
    }

    /// I6 regression: tearing down the failed VPN's engines on entry to
    /// emergency mode must release their ports, even though the engines
    /// are already gone from `State` (and so unreachable by id) by the
    /// time the delegated `stop_engine` call would normally look them up.
    #[tokio::test]
    async fn emergency_teardown_releases_ports() {
        let (fsm, state, prov) = fsm();
        let a = prov
            .start_engine(crate::provisioner::ProvisionRequest {
                vpn_id: Some("vpnA".to_string()),
                network: Some("vpnA".to_string()),
                forwarded: false,
            })
            .await
            .unwrap();
        let b = prov
            .start_engine(crate::provisioner::ProvisionRequest {
                vpn_id: Some("vpnB".to_string()),
                network: Some("vpnB".to_string()),
                forwarded: false,
            })
            .await
            .unwrap();
        assert_eq!(prov.ports_in_use(), 2);

        fsm.tick(true, false).await;

        assert!(state.is_emergency_mode());
        assert!(state.get_engine(&b.container_id).is_none());
        assert!(state.get_engine(&a.container_id).is_some());
        assert_eq!(prov.ports_in_use(), 1, "vpnB engine's port must be released, not leaked");
    }

    #[tokio::test]
    async fn both_unhealthy_stays_normal() {
        let (fsm, state, _prov) = fsm();
        fsm.tick(false, false).await;
        assert!(!state.is_emergency_mode());
    }

    #[tokio::test]
    async fn failed_vpn_recovering_enters_recovery_mode() {
        let (fsm, state, _prov) = fsm();
        state.enter_emergency_mode("vpnB", "vpnA");
        fsm.tick(true, true).await;
        assert!(!state.is_emergency_mode());
        assert!(state.is_vpn_recovery_mode());
        assert_eq!(state.vpn_recovery_target(), Some("vpnB".to_string()));
    }

    #[tokio::test]
    async fn recovery_exits_on_parity() {
        let (fsm, state, _prov) = fsm();
        state.enter_vpn_recovery_mode("vpnB");
        let mut a1 = Engine::new("a1", "a1", "h", 1);
        a1.vpn_id = Some("vpnA".to_string());
        let mut b1 = Engine::new("b1", "b1", "h", 2);
        b1.vpn_id = Some("vpnB".to_string());
        state.upsert_engine(a1);
        state.upsert_engine(b1);

        fsm.tick_recovery().await;
        assert!(!state.is_vpn_recovery_mode());
    }
}
