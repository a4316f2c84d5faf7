//! Background Docker-stats polling: one batch `stats()` call per tick across
//! every managed engine rather than one call per engine, with the sampling
//! interval adapted to fleet size (10s idle, 3s small fleets, 2s fleets over
//! 5 engines), built on the same `tokio::time::interval` +
//! `MissedTickBehavior::Skip` loop idiom used throughout this crate's other
//! background tasks.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::runtime::{ContainerRuntime, ContainerStats};
use crate::state::SharedState;
use std::sync::Arc;

/// Caches the latest per-engine resource sample so request handlers can
/// read it without an on-demand runtime call (handlers must not block
/// on I/O).
pub struct StatsCollector {
    state: SharedState,
    runtime: Arc<dyn ContainerRuntime>,
    cache: DashMap<String, ContainerStats>,
}

impl StatsCollector {
    pub fn new(state: SharedState, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            state,
            runtime,
            cache: DashMap::new(),
        }
    }

    pub fn latest(&self, container_id: &str) -> Option<ContainerStats> {
        self.cache.get(container_id).map(|r| r.clone())
    }

    /// `engine_count == 0` polls every 10s; 1-5 engines every 3s; more than
    /// 5 every 2s, matching the source's three-tier dynamic interval.
    fn dynamic_interval(engine_count: usize) -> Duration {
        if engine_count == 0 {
            Duration::from_secs(10)
        } else if engine_count <= 5 {
            Duration::from_secs(3)
        } else {
            Duration::from_secs(2)
        }
    }

    async fn poll_once(&self) {
        let ids: Vec<String> = self.state.list_engines().into_iter().map(|e| e.id).collect();
        if ids.is_empty() {
            return;
        }

        let sampled = self.runtime.stats(&ids).await;
        debug!(sampled = sampled.len(), requested = ids.len(), "stats collector: batch sample complete");

        for (id, stats) in sampled {
            self.cache.insert(id, stats);
        }
        self.cache.retain(|id, _| ids.contains(id));
    }

    /// Runs until `shutdown` reports `true`. Re-derives its own tick
    /// interval every loop iteration from the current fleet size rather
    /// than on a fixed schedule, since the fleet size is exactly what
    /// should drive the cadence.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let engine_count = self.state.list_engines().len();
            let mut ticker = time::interval(Self::dynamic_interval(engine_count));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately; consume it before the real wait

            tokio::select! {
                _ = ticker.tick() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            self.poll_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeRuntime;
    use crate::state::{Engine, State};

    #[tokio::test]
    async fn poll_once_populates_cache_for_known_engines() {
        let state = Arc::new(State::new(false));
        let runtime = Arc::new(FakeRuntime::new());
        let id = runtime
            .create(crate::runtime::CreateSpec {
                name: "e1".to_string(),
                image: "acestream/engine".to_string(),
                http_port: 6878,
                labels: std::collections::HashMap::new(),
                env: Vec::new(),
                network: None,
            })
            .await
            .unwrap();
        state.upsert_engine(Engine::new(id.clone(), "e1", "host", 6878));

        let collector = StatsCollector::new(state, runtime);
        collector.poll_once().await;

        assert!(collector.latest(&id).is_some());
    }

    #[tokio::test]
    async fn poll_once_evicts_stats_for_engines_no_longer_in_state() {
        let state = Arc::new(State::new(false));
        let runtime = Arc::new(FakeRuntime::new());
        let id = runtime
            .create(crate::runtime::CreateSpec {
                name: "e1".to_string(),
                image: "acestream/engine".to_string(),
                http_port: 6878,
                labels: std::collections::HashMap::new(),
                env: Vec::new(),
                network: None,
            })
            .await
            .unwrap();
        state.upsert_engine(Engine::new(id.clone(), "e1", "host", 6878));

        let collector = StatsCollector::new(state.clone(), runtime);
        collector.poll_once().await;
        assert!(collector.latest(&id).is_some());

        state.remove_engine(&id);
        collector.poll_once().await;
        assert!(collector.latest(&id).is_none());
    }

    #[tokio::test]
    async fn empty_fleet_uses_the_widest_interval() {
        assert_eq!(StatsCollector::dynamic_interval(0), Duration::from_secs(10));
        assert_eq!(StatsCollector::dynamic_interval(3), Duration::from_secs(3));
        assert_eq!(StatsCollector::dynamic_interval(6), Duration::from_secs(2));
    }
}
