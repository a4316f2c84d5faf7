//! Single gate for engine destruction. Four predicates, evaluated in order;
//! any negative predicate is decisive. Grace-window bookkeeping lives here
//! rather than in `State` since it's a pure scheduling concern, not model
//! data.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::state::{SharedState, StreamStatus};
use crate::validator::ReplicaValidator;

pub struct LifecycleController {
    state: SharedState,
    validator: std::sync::Arc<ReplicaValidator>,
    min_replicas: usize,
    min_free_replicas: usize,
    grace_period: Duration,
    empty_since: Mutex<HashMap<String, Instant>>,
}

impl LifecycleController {
    pub fn new(
        state: SharedState,
        validator: std::sync::Arc<ReplicaValidator>,
        min_replicas: usize,
        min_free_replicas: usize,
        grace_period: Duration,
    ) -> Self {
        Self {
            state,
            validator,
            min_replicas,
            min_free_replicas,
            grace_period,
            empty_since: Mutex::new(HashMap::new()),
        }
    }

    fn clear_grace(&self, container_id: &str) {
        self.empty_since.lock().remove(container_id);
    }

    pub async fn can_stop_engine(&self, container_id: &str, bypass_grace: bool) -> bool {
        // 1. Active-stream predicate.
        let active = self.state.list_streams(Some(StreamStatus::Started), Some(container_id));
        if !active.is_empty() {
            self.clear_grace(container_id);
            return false;
        }

        let result = self.validator.validate_and_sync(false).await;

        // 2. MIN_REPLICAS predicate. The >=1 guard avoids blocking cleanup
        // of stale state when the runtime already reports zero.
        if result.total_running >= 1 && result.total_running.saturating_sub(1) < self.min_replicas {
            self.clear_grace(container_id);
            return false;
        }

        // 3. MIN_FREE_REPLICAS predicate.
        if self.min_free_replicas > 0 && result.free_count > 0 && result.free_count.saturating_sub(1) < self.min_free_replicas {
            self.clear_grace(container_id);
            return false;
        }

        // 4. Per-VPN balance predicate (redundant mode only) is applied by
        // the caller before invoking this gate, since it needs knowledge of
        // which VPN pair is in play; see `LifecycleController::vpn_balance_allows_stop`.

        if bypass_grace || self.grace_period.is_zero() {
            self.clear_grace(container_id);
            return true;
        }

        let mut grace = self.empty_since.lock();
        match grace.get(container_id) {
            None => {
                grace.insert(container_id.to_string(), Instant::now());
                false
            }
            Some(since) => {
                if since.elapsed() >= self.grace_period {
                    grace.remove(container_id);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Per-VPN balance predicate for redundant mode: returns false (deny
    /// stop) if removing `engine_vpn` would increase the absolute
    /// engine-count imbalance between the two VPNs, unless both VPNs
    /// already have more than `min_replicas/2` engines, in which case the
    /// check relaxes to "don't stop from the VPN with fewer engines".
    pub fn vpn_balance_allows_stop(&self, engine_vpn: &str, other_vpn: &str) -> bool {
        let count_a = self.state.engines_by_vpn(engine_vpn).len();
        let count_b = self.state.engines_by_vpn(other_vpn).len();

        let relaxed_threshold = self.min_replicas / 2;
        if count_a > relaxed_threshold && count_b > relaxed_threshold {
            return count_a >= count_b;
        }

        let current_imbalance = count_a.abs_diff(count_b);
        let after_imbalance = (count_a.saturating_sub(1)).abs_diff(count_b);
        after_imbalance <= current_imbalance
    }

    /// Selects stop candidates from `candidates` (already filtered to VPN
    /// pairing concerns by the caller) in ascending port order, applying
    /// `can_stop_engine` until `excess` is absorbed or the list runs out.
    pub async fn select_stop_candidates(&self, mut candidates: Vec<(String, u16)>, excess: usize) -> Vec<String> {
        candidates.sort_by_key(|(_, port)| *port);
        let mut stopped = Vec::new();
        for (id, _) in candidates {
            if stopped.len() >= excess {
                break;
            }
            if self.can_stop_engine(&id, false).await {
                stopped.push(id);
            }
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_allocator::PortAllocator;
    use crate::provisioner::Provisioner;
    use crate::runtime::FakeRuntime;
    use crate::state::{Engine, State, StreamStartedEvent};
    use std::sync::Arc;

    fn controller(min_replicas: usize, min_free: usize, grace: Duration) -> (LifecycleController, SharedState, Arc<FakeRuntime>) {
        let state = Arc::new(State::new(false));
        let runtime = Arc::new(FakeRuntime::new());
        let ports = PortAllocator::new(6000..=6100, 7000..=7010);
        let provisioner = Arc::new(Provisioner::new(state.clone(), runtime.clone(), ports, "acestream/engine".to_string()));
        let validator = Arc::new(ReplicaValidator::new(state.clone(), runtime.clone(), provisioner));
        (
            LifecycleController::new(state.clone(), validator, min_replicas, min_free, grace),
            state,
            runtime,
        )
    }

    #[tokio::test]
    async fn active_stream_engine_cannot_stop() {
        let (lc, state, _rt) = controller(0, 0, Duration::ZERO);
        state.upsert_engine(Engine::new("e1", "e1", "h", 1));
        state.on_stream_started(StreamStartedEvent {
            stream_id: None,
            container_id: "e1".to_string(),
            host: "h".to_string(),
            port: 1,
            key_type: "infohash".to_string(),
            key: "k".to_string(),
            labels: HashMap::new(),
        });
        assert!(!lc.can_stop_engine("e1", false).await);
    }

    #[tokio::test]
    async fn grace_window_delays_then_permits_stop() {
        let (lc, state, rt) = controller(0, 0, Duration::from_millis(20));
        state.upsert_engine(Engine::new("e1", "e1", "h", 1));
        rt.seed(crate::runtime::ObservedContainer {
            id: "e1".to_string(),
            name: "e1".to_string(),
            running: true,
            labels: HashMap::new(),
            host_port: Some(1),
            healthy: None,
        })
        .await;

        assert!(!lc.can_stop_engine("e1", false).await, "first call starts the grace window");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lc.can_stop_engine("e1", false).await, "grace window elapsed");
    }

    #[tokio::test]
    async fn min_replicas_blocks_stop() {
        let (lc, state, rt) = controller(1, 0, Duration::ZERO);
        state.upsert_engine(Engine::new("e1", "e1", "h", 1));
        rt.seed(crate::runtime::ObservedContainer {
            id: "e1".to_string(),
            name: "e1".to_string(),
            running: true,
            labels: HashMap::new(),
            host_port: Some(1),
            healthy: None,
        })
        .await;
        assert!(!lc.can_stop_engine("e1", true).await, "stopping would drop below MIN_REPLICAS=1");
    }
}
