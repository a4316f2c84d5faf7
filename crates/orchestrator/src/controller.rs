//! Owns every subsystem instance and the config snapshot they were built
//! from: one value constructed once at startup, cloned (by `Arc`) into every
//! handler and background task instead of reaching through global statics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::autoscaler::Autoscaler;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::{Config, VpnMode};
use crate::engine_client::EngineClient;
use crate::event_sink::{EventSink, TracingEventSink};
use crate::lifecycle::LifecycleController;
use crate::monitor::MonitorLoop;
use crate::port_allocator::PortAllocator;
use crate::provisioner::Provisioner;
use crate::runtime::ContainerRuntime;
use crate::state::SharedState;
use crate::stats_collector::StatsCollector;
use crate::validator::ReplicaValidator;
use crate::vpn::{EmergencyModeFsm, ForwardedEngineElector, VpnHealthMonitor};

/// Everything a request handler or background task needs, bundled behind
/// one `Arc` clone rather than threaded through as a dozen separate
/// arguments. Always shared as `Arc<Controller>` — axum's `State` extractor is happy
/// with that since `Arc<T>: Clone` regardless of `T`.
pub struct Controller {
    pub config: Config,
    pub state: SharedState,
    pub validator: Arc<ReplicaValidator>,
    pub provisioner: Arc<Provisioner>,
    pub autoscaler: Arc<Autoscaler>,
    pub lifecycle: Arc<LifecycleController>,
    pub breaker: Arc<CircuitBreakerManager>,
    pub elector: Arc<ForwardedEngineElector>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub engine_client: Arc<EngineClient>,
    pub stats: Arc<StatsCollector>,
    pub events: Arc<dyn EventSink>,
    /// Only present when `vpn.mode == redundant`; drives the Emergency /
    /// Recovery FSM. Single-VPN mode only needs `vpn_health`.
    pub emergency_fsm: Option<Arc<EmergencyModeFsm>>,
    pub vpn_health: Option<Arc<VpnHealthMonitor>>,
    /// False until the initial `ensure_minimum(true)` startup batch has
    /// completed; `/ready` reports this verbatim.
    ready: AtomicBool,
    pub shutdown_tx: watch::Sender<bool>,
}

impl Controller {
    pub fn bootstrap(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Arc<Self> {
        let redundant = config.vpn.is_redundant();
        let state: SharedState = Arc::new(crate::state::State::new(redundant));

        let ports = PortAllocator::new(
            config.ports.regular_range_start..=config.ports.regular_range_end,
            config.ports.forwarded_range_start..=config.ports.forwarded_range_end,
        );
        let provisioner = Arc::new(Provisioner::new(state.clone(), runtime.clone(), ports, config.runtime.image.clone()));
        let validator = Arc::new(ReplicaValidator::new(state.clone(), runtime.clone(), provisioner.clone()));
        let lifecycle = Arc::new(LifecycleController::new(
            state.clone(),
            validator.clone(),
            config.replicas.min_replicas,
            config.replicas.min_free_replicas,
            Duration::from_secs(config.lifecycle.engine_grace_period_s),
        ));
        let breaker = Arc::new(CircuitBreakerManager::new(
            config.circuit_breaker.general_failure_threshold,
            Duration::from_secs(config.circuit_breaker.general_recovery_timeout_s),
            config.circuit_breaker.replacement_failure_threshold,
            Duration::from_secs(config.circuit_breaker.replacement_recovery_timeout_s),
        ));
        let elector = Arc::new(ForwardedEngineElector::new(state.clone()));
        let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);
        let engine_client = Arc::new(EngineClient::new());
        let stats = Arc::new(StatsCollector::new(state.clone(), runtime.clone()));

        let vpn_pair = match config.vpn.mode {
            VpnMode::None => None,
            VpnMode::Single => config.vpn.gluetun_container_name.clone().map(|v| (v.clone(), v)),
            VpnMode::Redundant => match (&config.vpn.gluetun_container_name, &config.vpn.gluetun_container_name_2) {
                (Some(a), Some(b)) => Some((a.clone(), b.clone())),
                _ => None,
            },
        };

        let autoscaler = Arc::new(Autoscaler::new(
            state.clone(),
            validator.clone(),
            provisioner.clone(),
            lifecycle.clone(),
            breaker.clone(),
            elector.clone(),
            config.replicas.min_replicas,
            config.replicas.min_free_replicas,
            config.replicas.max_replicas,
            config.replicas.max_active_replicas,
            vpn_pair.clone(),
            redundant,
        ));

        let vpn_health = if config.vpn.is_configured() {
            Some(Arc::new(VpnHealthMonitor::new(runtime.clone(), engine_client.clone(), state.clone())))
        } else {
            None
        };

        let emergency_fsm = if redundant {
            vpn_pair.clone().map(|(a, b)| {
                Arc::new(EmergencyModeFsm::new(
                    state.clone(),
                    provisioner.clone(),
                    events.clone(),
                    a,
                    b,
                    Duration::from_secs(config.vpn.recovery_stabilization_s),
                ))
            })
        } else {
            None
        };

        let (shutdown_tx, _rx) = watch::channel(false);

        Arc::new(Self {
            config,
            state,
            validator,
            provisioner,
            autoscaler,
            lifecycle,
            breaker,
            elector,
            runtime,
            engine_client,
            stats,
            events,
            emergency_fsm,
            vpn_health,
            ready: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn build_monitor_loop(&self) -> MonitorLoop {
        MonitorLoop::new(
            self.state.clone(),
            self.runtime.clone(),
            self.validator.clone(),
            self.provisioner.clone(),
            self.autoscaler.clone(),
            self.lifecycle.clone(),
            self.events.clone(),
            Duration::from_secs(self.config.monitor.monitor_interval_s),
            Duration::from_secs(self.config.monitor.autoscale_interval_s),
            self.config.lifecycle.auto_delete,
        )
    }

    /// Runs the one-time startup provisioning batch (`initial_startup=true`)
    /// and flips `/ready` once it returns — whether
    /// or not it fully reached `MIN_REPLICAS` (a degraded-but-serving
    /// process is still ready; `/orchestrator/status` reports the deficit).
    pub async fn run_startup_provisioning(&self) {
        if let Err(e) = self.provisioner.reindex().await {
            warn!(error = %e, "startup reindex failed");
        }
        self.elector.reconcile_initial();

        let outcome = self.autoscaler.ensure_minimum(true).await;
        info!(provisioned = outcome.provisioned, failed = outcome.failed, "initial startup provisioning complete");
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// `POST /gc`: sweeps every idle engine through the lifecycle gate and
    /// stops the ones it allows, independent of the `AUTO_DELETE` monitor
    /// setting — an explicit admin trigger rather than the background
    /// policy in `MonitorLoop::sweep_idle`.
    pub async fn run_gc(&self) -> usize {
        let idle: Vec<String> = self.state.list_engines().into_iter().filter(|e| e.is_free()).map(|e| e.id).collect();

        let mut stopped = 0;
        for id in idle {
            if self.lifecycle.can_stop_engine(&id, false).await {
                match self.provisioner.stop_engine(&id).await {
                    Ok(()) => stopped += 1,
                    Err(e) => warn!(engine_id = id, error = %e, "gc: failed to stop idle engine"),
                }
            }
        }
        stopped
    }

    /// Spawns the per-VPN health sampler. Single-VPN mode just records
    /// health in `State`; redundant mode additionally drives the Emergency
    /// FSM off the same samples. Returns `None` when no VPN is
    /// configured at all.
    pub fn spawn_vpn_health_sampler(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let vpn_health = self.vpn_health.clone()?;
        let vpn_a = self.config.vpn.gluetun_container_name.clone()?;
        let vpn_b = self.config.vpn.gluetun_container_name_2.clone();
        let emergency_fsm = self.emergency_fsm.clone();
        let interval = Duration::from_secs(self.config.vpn.health_sample_interval_s);
        let mut shutdown = self.shutdown_tx.subscribe();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                }

                let health_a = vpn_health.sample(&vpn_a, &vpn_a).await;
                if let (Some(vpn_b), Some(fsm)) = (&vpn_b, &emergency_fsm) {
                    let health_b = vpn_health.sample(vpn_b, vpn_b).await;
                    fsm.tick(health_a, health_b).await;
                }
            }
        }))
    }

    /// Spawns the background Docker-stats poller. Always runs, VPN or not —
    /// resource sampling is independent of VPN configuration.
    pub fn spawn_stats_collector(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let stats = self.stats.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move { stats.run(shutdown).await })
    }
}
