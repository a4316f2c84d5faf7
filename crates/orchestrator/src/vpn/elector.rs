//! At most one engine per VPN carries the forwarded P2P port (I2). Election
//! happens on initial reindex (repairing a historical multi-forwarded bug),
//! on provisioning (elect immediately if the VPN has none), and implicitly
//! on deletion of the forwarded engine (simply leaves the VPN without one
//! until the autoscaler restores `MIN_REPLICAS`).

use std::collections::HashMap;

use tracing::warn;

use crate::state::{Engine, SharedState};

pub struct ForwardedEngineElector {
    state: SharedState,
}

impl ForwardedEngineElector {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Runs once after Reindex: if the runtime's labels report more than
    /// one forwarded engine for a VPN (a historical bug), demote all but
    /// the lowest-port one.
    pub fn reconcile_initial(&self) {
        let engines = self.state.list_engines();
        let mut by_vpn: HashMap<Option<String>, Vec<Engine>> = HashMap::new();
        for engine in engines {
            by_vpn.entry(engine.vpn_id.clone()).or_default().push(engine);
        }

        for (vpn_id, group) in by_vpn {
            let mut forwarded: Vec<&Engine> = group.iter().filter(|e| e.forwarded).collect();
            if forwarded.len() <= 1 {
                continue;
            }
            forwarded.sort_by_key(|e| e.http_port);
            let keep = forwarded[0].id.clone();
            warn!(vpn = ?vpn_id, keep, demoted = forwarded.len() - 1, "multiple forwarded engines found for one vpn, demoting all but lowest port");
            for e in forwarded.into_iter().skip(1) {
                self.state.clear_forwarded(&e.id);
            }
        }
    }

    /// Called right after a successful `start_engine`: elects the new
    /// engine as forwarded if its VPN currently has none.
    pub fn elect_on_provision(&self, container_id: &str, vpn_id: Option<&str>) {
        let already_has_one = match vpn_id {
            Some(vpn) => self.state.has_forwarded_engine_for_vpn(vpn),
            None => self.state.get_forwarded_engine().is_some(),
        };
        if !already_has_one {
            self.state.set_forwarded_engine(container_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    #[test]
    fn reconcile_keeps_lowest_port_demotes_rest() {
        let state = std::sync::Arc::new(State::new(true));
        let mut a = Engine::new("a", "a", "h", 6000);
        a.vpn_id = Some("vpnA".to_string());
        a.forwarded = true;
        let mut b = Engine::new("b", "b", "h", 5000);
        b.vpn_id = Some("vpnA".to_string());
        b.forwarded = true;
        state.upsert_engine(a);
        state.upsert_engine(b);

        let elector = ForwardedEngineElector::new(state.clone());
        elector.reconcile_initial();

        assert!(state.get_engine("b").unwrap().forwarded, "lowest port kept");
        assert!(!state.get_engine("a").unwrap().forwarded);
    }

    #[test]
    fn elect_on_provision_only_when_vpn_has_none() {
        let state = std::sync::Arc::new(State::new(true));
        let mut existing = Engine::new("e1", "e1", "h", 1);
        existing.vpn_id = Some("vpnA".to_string());
        existing.forwarded = true;
        state.upsert_engine(existing);
        state.upsert_engine(Engine::new("e2", "e2", "h", 2));
        state.set_engine_vpn("e2", Some("vpnA".to_string()));

        let elector = ForwardedEngineElector::new(state.clone());
        elector.elect_on_provision("e2", Some("vpnA"));

        assert!(!state.get_engine("e2").unwrap().forwarded, "vpnA already has a forwarded engine");
    }
}
