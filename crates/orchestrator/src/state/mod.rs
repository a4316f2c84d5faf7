//! Authoritative in-memory model of engines, streams, and process-wide modes.
//!
//! A single `parking_lot::Mutex<StateInner>` covers every map so composite
//! reads (e.g. "engines by VPN with active-stream counts") observe a
//! consistent snapshot. Every public method acquires the lock exactly once
//! and delegates to a private helper operating on `&mut StateInner` — no
//! method ever calls back into a locking public method while the lock is
//! held, so a plain `Mutex` is enough without needing real reentrancy.

pub mod engine;
pub mod modes;
pub mod stream;

pub use engine::{Engine, Health};
pub use modes::{EmergencyMode, ReprovisioningMode, VpnHealth, VpnRecoveryMode};
pub use stream::{Stream, StreamEndedEvent, StreamStartedEvent, StreamStatus};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

pub type SharedState = Arc<State>;

/// Outcome of `on_stream_ended`: the ended stream, and whether its engine
/// has now dropped to zero active streams (a signal the lifecycle manager
/// may want to act on).
#[derive(Debug, Clone)]
pub struct StreamEndedOutcome {
    pub stream: Stream,
    pub engine_became_idle: bool,
}

struct StateInner {
    engines: HashMap<String, Engine>,
    streams: HashMap<String, Stream>,
    emergency: EmergencyMode,
    reprovisioning: ReprovisioningMode,
    vpn_recovery: VpnRecoveryMode,
    vpn_health: HashMap<String, VpnHealth>,
    lookahead_layer: Option<usize>,
}

impl StateInner {
    fn new() -> Self {
        Self {
            engines: HashMap::new(),
            streams: HashMap::new(),
            emergency: EmergencyMode::default(),
            reprovisioning: ReprovisioningMode::default(),
            vpn_recovery: VpnRecoveryMode::default(),
            vpn_health: HashMap::new(),
            lookahead_layer: None,
        }
    }

    fn is_redundant_mode(&self, cfg_vpn_mode_redundant: bool) -> bool {
        cfg_vpn_mode_redundant
    }
}

pub struct State {
    inner: Mutex<StateInner>,
    /// Whether the deployment is configured for redundant (dual) VPN mode;
    /// immutable for the process lifetime, set from `Config` at construction.
    redundant_vpn: bool,
}

impl State {
    pub fn new(redundant_vpn: bool) -> Self {
        Self {
            inner: Mutex::new(StateInner::new()),
            redundant_vpn,
        }
    }

    // ---- Stream lifecycle -------------------------------------------------

    /// Idempotent on `(stream_id, container_id)`: a repeat delivery of the
    /// same `stream_started` event updates `last_seen`/`last_stream_usage`
    /// and returns the existing stream rather than duplicating it.
    pub fn on_stream_started(&self, evt: StreamStartedEvent) -> Stream {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let engine = inner
            .engines
            .entry(evt.container_id.clone())
            .or_insert_with(|| {
                let mut e = Engine::new(
                    evt.container_id.clone(),
                    format!("engine-{}", &evt.container_id[..evt.container_id.len().min(12)]),
                    evt.host.clone(),
                    evt.port,
                );
                e.labels = evt.labels.clone();
                e
            });

        engine.host = evt.host.clone();
        engine.http_port = evt.port;
        engine.last_seen = now;
        engine.last_stream_usage = now;
        for (k, v) in &evt.labels {
            engine.labels.entry(k.clone()).or_insert_with(|| v.clone());
        }

        let stream_id = evt
            .stream_id
            .clone()
            .unwrap_or_else(|| format!("{}|{}", evt.key, uuid::Uuid::new_v4()));

        if let Some(existing) = inner.streams.get(&stream_id) {
            return existing.clone();
        }

        let stream = Stream {
            id: stream_id.clone(),
            container_id: evt.container_id.clone(),
            key_type: evt.key_type,
            key: evt.key,
            started_at: now,
            ended_at: None,
            status: StreamStatus::Started,
        };
        inner.streams.insert(stream_id.clone(), stream.clone());

        if let Some(engine) = inner.engines.get_mut(&evt.container_id) {
            if !engine.streams.contains(&stream_id) {
                engine.streams.push(stream_id);
            }
        }

        stream
    }

    /// Marks the stream ended, detaches it from its engine's stream list,
    /// and immediately deletes the stream record from memory (history is
    /// the external event log's concern, not this crate's).
    pub fn on_stream_ended(&self, evt: StreamEndedEvent) -> Option<StreamEndedOutcome> {
        let mut inner = self.inner.lock();

        let stream_id = if let Some(id) = &evt.stream_id {
            if inner.streams.contains_key(id) {
                Some(id.clone())
            } else {
                None
            }
        } else {
            None
        };

        let stream_id = stream_id.or_else(|| {
            evt.container_id.as_ref().and_then(|cid| {
                inner
                    .streams
                    .values()
                    .filter(|s| &s.container_id == cid && s.status == StreamStatus::Started)
                    .map(|s| s.id.clone())
                    .next()
            })
        })?;

        let mut stream = inner.streams.remove(&stream_id)?;
        let now = Utc::now();
        stream.ended_at = Some(now);
        stream.status = StreamStatus::Ended;

        let mut engine_became_idle = false;
        if let Some(engine) = inner.engines.get_mut(&stream.container_id) {
            engine.streams.retain(|s| s != &stream_id);
            if engine.streams.is_empty() {
                engine_became_idle = true;
            }
        }

        Some(StreamEndedOutcome {
            stream,
            engine_became_idle,
        })
    }

    pub fn list_engines(&self) -> Vec<Engine> {
        self.inner.lock().engines.values().cloned().collect()
    }

    pub fn get_engine(&self, id: &str) -> Option<Engine> {
        self.inner.lock().engines.get(id).cloned()
    }

    pub fn remove_engine(&self, id: &str) -> Option<Engine> {
        self.inner.lock().engines.remove(id)
    }

    /// Inserts or replaces an engine wholesale — used by Reindex to rehydrate
    /// state from runtime-observed containers, and by the Provisioner on a
    /// successful `start_engine`.
    pub fn upsert_engine(&self, engine: Engine) {
        self.inner.lock().engines.insert(engine.id.clone(), engine);
    }

    pub fn list_streams(&self, status: Option<StreamStatus>, container_id: Option<&str>) -> Vec<Stream> {
        self.inner
            .lock()
            .streams
            .values()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .filter(|s| container_id.map_or(true, |cid| s.container_id == cid))
            .cloned()
            .collect()
    }

    pub fn get_stream(&self, id: &str) -> Option<Stream> {
        self.inner.lock().streams.get(id).cloned()
    }

    pub fn update_engine_health(&self, id: &str, health: Health) {
        if let Some(e) = self.inner.lock().engines.get_mut(id) {
            e.health = health;
        }
    }

    pub fn set_engine_vpn(&self, container_id: &str, vpn_id: Option<String>) {
        if let Some(e) = self.inner.lock().engines.get_mut(container_id) {
            e.vpn_id = vpn_id;
        }
    }

    pub fn engines_by_vpn(&self, vpn_id: &str) -> Vec<Engine> {
        self.inner
            .lock()
            .engines
            .values()
            .filter(|e| e.vpn_id.as_deref() == Some(vpn_id))
            .cloned()
            .collect()
    }

    /// Backup sweep for ended streams that somehow survived in memory past
    /// `max_age` — `on_stream_ended` already deletes immediately, so this
    /// should normally find nothing; it exists as a defensive safety net.
    pub fn sweep_stale_streams(&self, max_age: std::time::Duration) -> usize {
        let mut inner = self.inner.lock();
        let cutoff = Utc::now() - ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::zero());
        let stale: Vec<String> = inner
            .streams
            .iter()
            .filter(|(_, s)| s.status == StreamStatus::Ended && s.ended_at.map_or(false, |t| t < cutoff))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.streams.remove(id);
        }
        stale.len()
    }

    // ---- Forwarded engine (I2) --------------------------------------------

    /// Enforces I2 in scope of the engine's VPN only (redundant mode); in
    /// single-VPN mode, clears every other engine's `forwarded` flag.
    pub fn set_forwarded_engine(&self, engine_id: &str) {
        let mut inner = self.inner.lock();
        let target_vpn = match inner.engines.get(engine_id) {
            Some(e) => e.vpn_id.clone(),
            None => {
                warn!(engine_id, "cannot set forwarded flag: engine not found");
                return;
            }
        };
        let redundant = self.redundant_vpn;

        for engine in inner.engines.values_mut() {
            if engine.id == engine_id {
                continue;
            }
            if engine.forwarded && (!redundant || engine.vpn_id == target_vpn) {
                engine.forwarded = false;
            }
        }
        if let Some(e) = inner.engines.get_mut(engine_id) {
            e.forwarded = true;
        }
        info!(engine_id, vpn = ?target_vpn, "engine elected as forwarded");
    }

    pub fn get_forwarded_engine_for_vpn(&self, vpn_id: &str) -> Option<Engine> {
        self.inner
            .lock()
            .engines
            .values()
            .find(|e| e.forwarded && e.vpn_id.as_deref() == Some(vpn_id))
            .cloned()
    }

    pub fn has_forwarded_engine_for_vpn(&self, vpn_id: &str) -> bool {
        self.get_forwarded_engine_for_vpn(vpn_id).is_some()
    }

    pub fn get_forwarded_engine(&self) -> Option<Engine> {
        self.inner.lock().engines.values().find(|e| e.forwarded).cloned()
    }

    /// Demotes a single engine's forwarded flag without electing a
    /// replacement — used by the elector's initial-reindex repair pass
    /// (I2: at most one forwarded engine per VPN).
    pub fn clear_forwarded(&self, engine_id: &str) {
        if let Some(e) = self.inner.lock().engines.get_mut(engine_id) {
            e.forwarded = false;
        }
    }

    pub fn engine_count(&self) -> usize {
        self.inner.lock().engines.len()
    }

    // ---- Emergency mode -----------------------------------------------------

    /// Marks emergency mode active and removes every engine assigned to
    /// `failed_vpn` from state (the caller — Provisioner — is responsible
    /// for actually stopping those containers; this only returns their ids).
    /// Idempotent: a second call with emergency mode already active is a
    /// no-op and returns `None`.
    /// Returns `(id, http_port)` for every removed engine — callers must
    /// release each port themselves once the delegated container stop
    /// completes (I6), since the engine is gone from `State` by the time
    /// that happens and a later lookup by id would find nothing.
    pub fn enter_emergency_mode(&self, failed_vpn: &str, healthy_vpn: &str) -> Option<Vec<(String, u16)>> {
        let mut inner = self.inner.lock();
        if inner.emergency.active {
            warn!(failed_vpn = %inner.emergency.failed_vpn.clone().unwrap_or_default(), "already in emergency mode, ignoring re-entry");
            return None;
        }

        inner.emergency = EmergencyMode {
            active: true,
            failed_vpn: Some(failed_vpn.to_string()),
            healthy_vpn: Some(healthy_vpn.to_string()),
            entered_at: Some(Utc::now()),
        };

        let removed: Vec<(String, u16)> = inner
            .engines
            .values()
            .filter(|e| e.vpn_id.as_deref() == Some(failed_vpn))
            .map(|e| (e.id.clone(), e.http_port))
            .collect();
        for (id, _) in &removed {
            inner.engines.remove(id);
        }

        warn!(failed_vpn, healthy_vpn, removed = removed.len(), "entered emergency mode");
        Some(removed)
    }

    pub fn exit_emergency_mode(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.emergency.active {
            return false;
        }
        inner.emergency = EmergencyMode::default();
        info!("exited emergency mode");
        true
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.inner.lock().emergency.active
    }

    pub fn emergency_mode_info(&self) -> EmergencyMode {
        self.inner.lock().emergency.clone()
    }

    // ---- Reprovisioning mode -------------------------------------------------

    pub fn enter_reprovisioning_mode(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.reprovisioning.active {
            return false;
        }
        inner.reprovisioning = ReprovisioningMode {
            active: true,
            entered_at: Some(Utc::now()),
        };
        true
    }

    pub fn exit_reprovisioning_mode(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.reprovisioning.active {
            return false;
        }
        inner.reprovisioning = ReprovisioningMode::default();
        true
    }

    pub fn is_reprovisioning_mode(&self) -> bool {
        self.inner.lock().reprovisioning.active
    }

    // ---- VPN recovery mode ----------------------------------------------------

    pub fn enter_vpn_recovery_mode(&self, target_vpn: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.vpn_recovery.active {
            return false;
        }
        inner.vpn_recovery = VpnRecoveryMode {
            active: true,
            target_vpn: Some(target_vpn.to_string()),
            entered_at: Some(Utc::now()),
        };
        true
    }

    pub fn exit_vpn_recovery_mode(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.vpn_recovery.active {
            return false;
        }
        inner.vpn_recovery = VpnRecoveryMode::default();
        true
    }

    pub fn is_vpn_recovery_mode(&self) -> bool {
        self.inner.lock().vpn_recovery.active
    }

    pub fn vpn_recovery_target(&self) -> Option<String> {
        self.inner.lock().vpn_recovery.target_vpn.clone()
    }

    // ---- Per-VPN health bookkeeping --------------------------------------------

    pub fn record_vpn_healthy(&self, vpn_id: &str) {
        let mut inner = self.inner.lock();
        let entry = inner.vpn_health.entry(vpn_id.to_string()).or_default();
        entry.last_healthy_at = Some(Utc::now());
    }

    pub fn record_vpn_unhealthy(&self, vpn_id: &str) {
        let mut inner = self.inner.lock();
        let entry = inner.vpn_health.entry(vpn_id.to_string()).or_default();
        entry.last_unhealthy_at = Some(Utc::now());
    }

    pub fn set_vpn_stabilization_until(&self, vpn_id: &str, until: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        let entry = inner.vpn_health.entry(vpn_id.to_string()).or_default();
        entry.recovery_stabilization_until = Some(until);
    }

    pub fn vpn_health(&self, vpn_id: &str) -> VpnHealth {
        self.inner.lock().vpn_health.get(vpn_id).cloned().unwrap_or_default()
    }

    // ---- Lookahead layer --------------------------------------------------

    pub fn set_lookahead_layer(&self, n: usize) {
        self.inner.lock().lookahead_layer = Some(n);
    }

    pub fn get_lookahead_layer(&self) -> Option<usize> {
        self.inner.lock().lookahead_layer
    }

    pub fn reset_lookahead_layer(&self) {
        self.inner.lock().lookahead_layer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(container_id: &str, key: &str) -> StreamStartedEvent {
        StreamStartedEvent {
            stream_id: None,
            container_id: container_id.to_string(),
            host: "10.0.0.1".to_string(),
            port: 6878,
            key_type: "infohash".to_string(),
            key: key.to_string(),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn stream_started_creates_engine_and_stream() {
        let state = State::new(false);
        let stream = state.on_stream_started(started("c1", "k1"));
        assert_eq!(stream.container_id, "c1");
        let engine = state.get_engine("c1").unwrap();
        assert_eq!(engine.streams, vec![stream.id.clone()]);
    }

    #[test]
    fn stream_ended_detaches_and_deletes_stream() {
        let state = State::new(false);
        let stream = state.on_stream_started(started("c1", "k1"));
        let outcome = state
            .on_stream_ended(StreamEndedEvent {
                stream_id: Some(stream.id.clone()),
                container_id: None,
            })
            .unwrap();
        assert!(outcome.engine_became_idle);
        assert!(state.get_stream(&stream.id).is_none());
        assert!(state.get_engine("c1").unwrap().streams.is_empty());
    }

    #[test]
    fn stream_ended_unknown_id_returns_none() {
        let state = State::new(false);
        let outcome = state.on_stream_ended(StreamEndedEvent {
            stream_id: Some("nope".to_string()),
            container_id: None,
        });
        assert!(outcome.is_none());
    }

    #[test]
    fn forwarded_engine_single_vpn_mode_clears_others() {
        let state = State::new(false);
        state.upsert_engine(Engine::new("e1", "e1", "h", 1));
        state.upsert_engine(Engine::new("e2", "e2", "h", 2));
        state.set_forwarded_engine("e1");
        state.set_forwarded_engine("e2");
        assert!(!state.get_engine("e1").unwrap().forwarded);
        assert!(state.get_engine("e2").unwrap().forwarded);
    }

    #[test]
    fn forwarded_engine_redundant_mode_scopes_to_vpn() {
        let state = State::new(true);
        let mut a1 = Engine::new("a1", "a1", "h", 1);
        a1.vpn_id = Some("vpnA".to_string());
        let mut b1 = Engine::new("b1", "b1", "h", 2);
        b1.vpn_id = Some("vpnB".to_string());
        state.upsert_engine(a1);
        state.upsert_engine(b1);

        state.set_forwarded_engine("a1");
        state.set_forwarded_engine("b1");

        assert!(state.get_engine("a1").unwrap().forwarded, "different VPN, must stay forwarded");
        assert!(state.get_engine("b1").unwrap().forwarded);
    }

    #[test]
    fn enter_emergency_mode_removes_failed_vpn_engines_and_is_idempotent() {
        let state = State::new(true);
        let mut a1 = Engine::new("a1", "a1", "h", 1);
        a1.vpn_id = Some("vpnA".to_string());
        let mut b1 = Engine::new("b1", "b1", "h", 2);
        b1.vpn_id = Some("vpnB".to_string());
        state.upsert_engine(a1);
        state.upsert_engine(b1);

        let removed = state.enter_emergency_mode("vpnB", "vpnA").unwrap();
        assert_eq!(removed, vec![("b1".to_string(), 2)]);
        assert!(state.get_engine("b1").is_none());
        assert!(state.get_engine("a1").is_some());

        // Re-entry is a no-op.
        assert!(state.enter_emergency_mode("vpnB", "vpnA").is_none());
    }

    #[test]
    fn lookahead_layer_round_trips() {
        let state = State::new(false);
        assert_eq!(state.get_lookahead_layer(), None);
        state.set_lookahead_layer(3);
        assert_eq!(state.get_lookahead_layer(), Some(3));
        state.reset_lookahead_layer();
        assert_eq!(state.get_lookahead_layer(), None);
    }
}
