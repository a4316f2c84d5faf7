//! Computes deficit against `MIN_REPLICAS`/`MIN_FREE_REPLICAS`, drives
//! provisioning through the `Provisioner`, and picks the destination VPN in
//! redundant mode.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreakerManager;
use crate::error::{BlockedReasonCode, BlockedReasonDetails, OrchestratorError};
use crate::lifecycle::LifecycleController;
use crate::provisioner::{ProvisionRequest, ProvisionResponse, Provisioner};
use crate::state::SharedState;
use crate::validator::ReplicaValidator;
use crate::vpn::ForwardedEngineElector;

#[derive(Debug, Default, Clone, Copy)]
pub struct EnsureMinimumOutcome {
    pub provisioned: usize,
    pub stopped: usize,
    pub failed: usize,
}

pub struct Autoscaler {
    state: SharedState,
    validator: Arc<ReplicaValidator>,
    provisioner: Arc<Provisioner>,
    lifecycle: Arc<LifecycleController>,
    breaker: Arc<CircuitBreakerManager>,
    elector: Arc<ForwardedEngineElector>,
    min_replicas: usize,
    min_free_replicas: usize,
    max_replicas: usize,
    max_active_replicas: Option<usize>,
    /// `(vpn_a, vpn_b)` when redundant mode is configured; `Some((vpn, vpn))`
    /// with both entries equal when a single VPN is configured; `None` when
    /// no VPN is in play.
    vpn_pair: Option<(String, String)>,
    redundant: bool,
    round_robin: AtomicUsize,
}

impl Autoscaler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: SharedState,
        validator: Arc<ReplicaValidator>,
        provisioner: Arc<Provisioner>,
        lifecycle: Arc<LifecycleController>,
        breaker: Arc<CircuitBreakerManager>,
        elector: Arc<ForwardedEngineElector>,
        min_replicas: usize,
        min_free_replicas: usize,
        max_replicas: usize,
        max_active_replicas: Option<usize>,
        vpn_pair: Option<(String, String)>,
        redundant: bool,
    ) -> Self {
        Self {
            state,
            validator,
            provisioner,
            lifecycle,
            breaker,
            elector,
            min_replicas,
            min_free_replicas,
            max_replicas,
            max_active_replicas,
            vpn_pair,
            redundant,
            round_robin: AtomicUsize::new(0),
        }
    }

    fn gated(&self, initial_startup: bool) -> bool {
        if !self.breaker.can_provision("general") {
            warn!("autoscaler gated: circuit breaker open");
            return true;
        }
        if !initial_startup && (self.state.is_emergency_mode() || self.state.is_reprovisioning_mode()) {
            info!("autoscaler gated: emergency or reprovisioning mode active");
            return true;
        }
        false
    }

    /// `initial_startup=true` targets `MIN_REPLICAS` total engines;
    /// otherwise targets `MIN_FREE_REPLICAS` free engines.
    pub async fn ensure_minimum(&self, initial_startup: bool) -> EnsureMinimumOutcome {
        if self.gated(initial_startup) {
            return EnsureMinimumOutcome::default();
        }

        let result = self.validator.validate_and_sync(false).await;

        let mut deficit = if initial_startup {
            self.min_replicas.saturating_sub(result.total_running)
        } else {
            self.min_free_replicas.saturating_sub(result.free_count)
        };

        if let Some(max_active) = self.max_active_replicas {
            if self.vpn_pair.is_some() {
                let headroom = max_active.saturating_sub(result.total_running);
                if headroom == 0 {
                    info!(total_running = result.total_running, max_active, "at MAX_ACTIVE_REPLICAS, cannot provision more");
                    return EnsureMinimumOutcome::default();
                }
                deficit = deficit.min(headroom);
            }
        }

        if deficit == 0 {
            return EnsureMinimumOutcome::default();
        }

        let mut outcome = EnsureMinimumOutcome::default();
        for _ in 0..deficit {
            let vpn_id = self.choose_vpn(initial_startup);
            match self
                .provisioner
                .start_engine(ProvisionRequest {
                    vpn_id: vpn_id.clone(),
                    network: vpn_id.clone(),
                    forwarded: false,
                })
                .await
            {
                Ok(resp) => {
                    self.breaker.record_success("general");
                    self.elector.elect_on_provision(&resp.container_id, vpn_id.as_deref());
                    outcome.provisioned += 1;
                }
                Err(e) => {
                    self.breaker.record_failure("general");
                    warn!(error = %e, "provisioning attempt failed, continuing with remaining batch");
                    outcome.failed += 1;
                }
            }
        }

        if outcome.provisioned > 0 {
            if let Err(e) = self.provisioner.reindex().await {
                warn!(error = %e, "post-batch reindex failed");
            }
        }

        info!(provisioned = outcome.provisioned, failed = outcome.failed, initial_startup, "ensure_minimum batch complete");
        outcome
    }

    /// Clamps `demand` by `MIN_REPLICAS`/`MAX_REPLICAS` only (see
    /// DESIGN.md Open Question 1) and by `MAX_ACTIVE_REPLICAS` when a VPN is
    /// configured. Scale-down goes through `LifecycleController` and the
    /// `Provisioner` — never a direct runtime stop (I6). Stops within one
    /// batch fan out behind a bounded pool of 10 concurrent tasks rather
    /// than one at a time, so a large scale-down doesn't serialize behind
    /// N sequential container-stop round trips.
    pub async fn scale_to(&self, demand: usize) -> EnsureMinimumOutcome {
        if self.gated(false) {
            return EnsureMinimumOutcome::default();
        }

        let mut desired = demand.clamp(self.min_replicas, self.max_replicas);
        if let Some(max_active) = self.max_active_replicas {
            if self.vpn_pair.is_some() {
                desired = desired.min(max_active);
            }
        }

        let result = self.validator.validate_and_sync(false).await;
        let running = result.total_running;

        let mut outcome = EnsureMinimumOutcome::default();
        if desired > running {
            let to_add = desired - running;
            for _ in 0..to_add {
                let vpn_id = self.choose_vpn(false);
                match self
                    .provisioner
                    .start_engine(ProvisionRequest {
                        vpn_id: vpn_id.clone(),
                        network: vpn_id.clone(),
                        forwarded: false,
                    })
                    .await
                {
                    Ok(resp) => {
                        self.breaker.record_success("general");
                        self.elector.elect_on_provision(&resp.container_id, vpn_id.as_deref());
                        outcome.provisioned += 1;
                    }
                    Err(e) => {
                        self.breaker.record_failure("general");
                        warn!(error = %e, "scale_to provisioning attempt failed");
                        outcome.failed += 1;
                    }
                }
            }
            if outcome.provisioned > 0 {
                let _ = self.provisioner.reindex().await;
            }
        } else if desired < running {
            let excess = running - desired;
            let mut candidates: Vec<(String, u16)> = self
                .state
                .list_engines()
                .into_iter()
                .filter(|e| self.vpn_balance_allows(e))
                .map(|e| (e.id, e.http_port))
                .collect();
            candidates.sort_by_key(|(_, port)| *port);

            let stop_ids = self.lifecycle.select_stop_candidates(candidates, excess).await;
            let semaphore = Arc::new(tokio::sync::Semaphore::new(10));
            let mut joins = Vec::with_capacity(stop_ids.len());
            for id in stop_ids {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                let provisioner = self.provisioner.clone();
                joins.push(tokio::spawn(async move {
                    let _permit = permit;
                    let result = provisioner.stop_engine(&id).await;
                    (id, result)
                }));
            }
            for join in joins {
                match join.await {
                    Ok((id, Ok(()))) => outcome.stopped += 1,
                    Ok((id, Err(e))) => warn!(engine_id = id, error = %e, "scale_to stop failed"),
                    Err(e) => warn!(error = %e, "scale_to stop task panicked"),
                }
            }
        }

        info!(demand, desired, running, "scale_to complete");
        outcome
    }

    /// Direct single-engine provision (the `/provision/acestream` endpoint):
    /// subject to the same circuit-breaker/capacity gating as the batch
    /// paths above, but outside their deficit loop — one request, one
    /// engine, a structured `ProvisionBlocked` error when gated.
    pub async fn provision_one(&self) -> Result<ProvisionResponse, OrchestratorError> {
        if !self.breaker.can_provision("general") {
            let recovery_eta_seconds = self.breaker.status().get("general").map(|s| s.recovery_timeout_secs);
            return Err(OrchestratorError::ProvisionBlocked(BlockedReasonDetails {
                code: BlockedReasonCode::CircuitBreaker,
                message: "circuit breaker open, provisioning paused".to_string(),
                recovery_eta_seconds,
                can_retry: true,
                should_wait: true,
            }));
        }

        let result = self.validator.validate_and_sync(false).await;
        if result.total_running >= self.max_replicas {
            return Err(OrchestratorError::ProvisionBlocked(BlockedReasonDetails {
                code: BlockedReasonCode::MaxCapacity,
                message: format!("at max_replicas ({})", self.max_replicas),
                recovery_eta_seconds: None,
                can_retry: false,
                should_wait: false,
            }));
        }
        if let Some(max_active) = self.max_active_replicas {
            if self.vpn_pair.is_some() && result.total_running >= max_active {
                return Err(OrchestratorError::ProvisionBlocked(BlockedReasonDetails {
                    code: BlockedReasonCode::MaxCapacity,
                    message: format!("at max_active_replicas ({max_active})"),
                    recovery_eta_seconds: None,
                    can_retry: false,
                    should_wait: false,
                }));
            }
        }

        let vpn_id = self.choose_vpn(false);
        match self
            .provisioner
            .start_engine(ProvisionRequest {
                vpn_id: vpn_id.clone(),
                network: vpn_id.clone(),
                forwarded: false,
            })
            .await
        {
            Ok(resp) => {
                self.breaker.record_success("general");
                self.elector.elect_on_provision(&resp.container_id, vpn_id.as_deref());
                let _ = self.provisioner.reindex().await;
                Ok(resp)
            }
            Err(e) => {
                self.breaker.record_failure("general");
                Err(OrchestratorError::ProvisionFailed(e.to_string()))
            }
        }
    }

    /// Lookahead layer: when every engine is at capacity with the
    /// same per-engine stream count `k`, provision one more ahead of need.
    /// Suppressed until that count changes from the last-recorded layer.
    pub async fn maybe_lookahead_provision(&self) {
        if self.gated(false) {
            return;
        }

        let result = self.validator.validate_and_sync(false).await;
        if result.free_count > 0 {
            return;
        }

        let engines = self.state.list_engines();
        if engines.is_empty() {
            return;
        }

        let counts: Vec<usize> = engines.iter().map(|e| e.streams.len()).collect();
        let min_count = *counts.iter().min().unwrap();
        let max_count = *counts.iter().max().unwrap();
        if min_count != max_count {
            return;
        }

        if self.state.get_lookahead_layer() == Some(min_count) {
            return;
        }

        let vpn_id = self.choose_vpn(false);
        match self
            .provisioner
            .start_engine(ProvisionRequest {
                vpn_id: vpn_id.clone(),
                network: vpn_id.clone(),
                forwarded: false,
            })
            .await
        {
            Ok(resp) => {
                self.breaker.record_success("general");
                self.elector.elect_on_provision(&resp.container_id, vpn_id.as_deref());
                self.state.set_lookahead_layer(min_count);
                let _ = self.provisioner.reindex().await;
                info!(layer = min_count, "lookahead engine provisioned");
            }
            Err(e) => {
                self.breaker.record_failure("general");
                warn!(error = %e, "lookahead provisioning attempt failed");
            }
        }
    }

    /// VPN-balance wiring: for a non-redundant deployment every engine
    /// is a valid stop candidate; in redundant mode, defer to the VPN
    /// balance predicate.
    fn vpn_balance_allows(&self, engine: &crate::state::Engine) -> bool {
        if !self.redundant {
            return true;
        }
        let Some((a, b)) = &self.vpn_pair else { return true };
        let Some(vpn) = &engine.vpn_id else { return true };
        let other = if vpn == a { b } else { a };
        self.lifecycle.vpn_balance_allows_stop(vpn, other)
    }

    /// Emergency mode always targets the healthy VPN; recovery mode
    /// always targets the recovery target (except during initial startup,
    /// see DESIGN.md Open Question 2); otherwise the VPN with fewer
    /// engines, tied cases round-robin.
    fn choose_vpn(&self, initial_startup: bool) -> Option<String> {
        let (a, b) = self.vpn_pair.clone()?;
        if a == b {
            return Some(a);
        }

        if self.state.is_emergency_mode() {
            return self.state.emergency_mode_info().healthy_vpn;
        }
        if !initial_startup && self.state.is_vpn_recovery_mode() {
            if let Some(target) = self.state.vpn_recovery_target() {
                return Some(target);
            }
        }

        let count_a = self.state.engines_by_vpn(&a).len();
        let count_b = self.state.engines_by_vpn(&b).len();
        if count_a < count_b {
            Some(a)
        } else if count_b < count_a {
            Some(b)
        } else {
            let idx = self.round_robin.fetch_add(1, Ordering::Relaxed);
            Some(if idx % 2 == 0 { a } else { b })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_allocator::PortAllocator;
    use crate::provisioner::ProvisionRequest;
    use crate::runtime::FakeRuntime;
    use crate::state::{State, StreamStartedEvent};
    use std::time::Duration;

    struct Harness {
        autoscaler: Autoscaler,
        state: SharedState,
        runtime: Arc<FakeRuntime>,
        provisioner: Arc<Provisioner>,
    }

    fn harness(min_replicas: usize, min_free: usize, max_replicas: usize, max_active: Option<usize>, vpn_pair: Option<(String, String)>, redundant: bool) -> Harness {
        let state = Arc::new(State::new(redundant));
        let runtime = Arc::new(FakeRuntime::new());
        let ports = PortAllocator::new(6000..=6100, 7000..=7010);
        let provisioner = Arc::new(Provisioner::new(state.clone(), runtime.clone(), ports, "acestream/engine".to_string()));
        let validator = Arc::new(ReplicaValidator::new(state.clone(), runtime.clone(), provisioner.clone()));
        let lifecycle = Arc::new(LifecycleController::new(state.clone(), validator.clone(), min_replicas, min_free, Duration::ZERO));
        let breaker = Arc::new(CircuitBreakerManager::default());
        let elector = Arc::new(ForwardedEngineElector::new(state.clone()));

        let autoscaler = Autoscaler::new(
            state.clone(),
            validator,
            provisioner.clone(),
            lifecycle,
            breaker,
            elector,
            min_replicas,
            min_free,
            max_replicas,
            max_active,
            vpn_pair,
            redundant,
        );

        Harness {
            autoscaler,
            state,
            runtime,
            provisioner,
        }
    }

    fn started(container_id: &str) -> StreamStartedEvent {
        StreamStartedEvent {
            stream_id: None,
            container_id: container_id.to_string(),
            host: "h".to_string(),
            port: 1,
            key_type: "infohash".to_string(),
            key: "k".to_string(),
            labels: std::collections::HashMap::new(),
        }
    }

    /// S1: MIN_FREE_REPLICAS=2, 3 engines already busy -> 2 more provisioned.
    /// Pre-seeds through `Provisioner` directly so the single `ensure_minimum`
    /// call in this test sees a cold validator cache.
    #[tokio::test]
    async fn min_free_enforcement_scenario() {
        let h = harness(0, 2, 20, None, None, false);
        for _ in 0..3 {
            let resp = h.provisioner.start_engine(ProvisionRequest::default()).await.unwrap();
            h.state.on_stream_started(started(&resp.container_id));
        }

        let outcome = h.autoscaler.ensure_minimum(false).await;
        assert_eq!(outcome.provisioned, 2);
        assert_eq!(h.runtime.count().await, 5);
    }

    /// S5: scale_to never leaks ports — scaling an existing fleet of 15 down
    /// to 5 leaves exactly 5 containers and 5 port reservations.
    #[tokio::test]
    async fn scale_down_releases_ports() {
        let h = harness(0, 0, 20, None, None, false);
        for _ in 0..15 {
            h.provisioner.start_engine(ProvisionRequest::default()).await.unwrap();
        }
        assert_eq!(h.runtime.count().await, 15);

        h.autoscaler.scale_to(5).await;
        assert_eq!(h.runtime.count().await, 5);
    }

    #[tokio::test]
    async fn max_active_replicas_clamps_deficit_under_vpn() {
        let h = harness(5, 0, 20, Some(2), Some(("vpnA".to_string(), "vpnA".to_string())), false);
        let outcome = h.autoscaler.ensure_minimum(true).await;
        assert_eq!(outcome.provisioned, 2, "clamped to MAX_ACTIVE_REPLICAS despite MIN_REPLICAS=5");
    }

    /// S2: lookahead fires once when every engine is saturated at the same
    /// per-engine stream count, and does not repeat immediately afterward.
    #[tokio::test]
    async fn lookahead_layer_suppresses_repeat_trigger() {
        let h = harness(0, 0, 20, None, None, false);
        for _ in 0..3 {
            let resp = h.provisioner.start_engine(ProvisionRequest::default()).await.unwrap();
            h.state.on_stream_started(started(&resp.container_id));
        }

        h.autoscaler.maybe_lookahead_provision().await;
        assert_eq!(h.runtime.count().await, 4);
        assert_eq!(h.state.get_lookahead_layer(), Some(1));

        h.autoscaler.maybe_lookahead_provision().await;
        assert_eq!(h.runtime.count().await, 4, "the fresh engine is free, so the uniform-saturation condition no longer holds");
    }

    #[tokio::test]
    async fn redundant_mode_assigns_to_fewer_engines_vpn() {
        let h = harness(0, 0, 20, None, Some(("vpnA".to_string(), "vpnB".to_string())), true);
        h.provisioner
            .start_engine(ProvisionRequest {
                vpn_id: Some("vpnA".to_string()),
                network: Some("vpnA".to_string()),
                forwarded: false,
            })
            .await
            .unwrap();

        h.autoscaler.scale_to(2).await;
        assert_eq!(h.state.engines_by_vpn("vpnB").len(), 1, "new engine should balance onto the emptier vpn");
    }
}
