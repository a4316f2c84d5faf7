//! Seam for the external event/history log (out of scope here — the real
//! persistence layer is a collaborator this crate doesn't implement). The
//! in-process default emits structured `tracing` events instead, so state
//! transitions are never silently dropped even without the database
//! collaborator wired up.

use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    CircuitBreakerTransition { operation_type: String, from: String, to: String },
    EmergencyModeEntered { failed_vpn: String, healthy_vpn: String },
    EmergencyModeExited,
    VpnRecoveryEntered { target_vpn: String },
    VpnRecoveryExited,
    InvariantViolationRepaired { detail: String },
    StateMismatchDetected { state_count: usize, runtime_count: usize },
    EngineProvisioned { container_id: String, vpn_id: Option<String> },
    EngineStopped { container_id: String },
}

/// `force_reset` and friends call this directly; periodic tasks call it as
/// a side effect of a state transition rather than on every attempt —
/// "logged once per state transition, not per attempt".
pub trait EventSink: Send + Sync {
    fn record(&self, event: OrchestratorEvent);
}

#[derive(Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::CircuitBreakerTransition { operation_type, from, to } => {
                info!(operation_type, from, to, "circuit breaker state transition");
            }
            OrchestratorEvent::EmergencyModeEntered { failed_vpn, healthy_vpn } => {
                warn!(failed_vpn, healthy_vpn, "emergency mode entered");
            }
            OrchestratorEvent::EmergencyModeExited => {
                info!("emergency mode exited");
            }
            OrchestratorEvent::VpnRecoveryEntered { target_vpn } => {
                info!(target_vpn, "vpn recovery mode entered");
            }
            OrchestratorEvent::VpnRecoveryExited => {
                info!("vpn recovery mode exited, round-robin assignment resumed");
            }
            OrchestratorEvent::InvariantViolationRepaired { detail } => {
                warn!(detail, "invariant violation detected and repaired");
            }
            OrchestratorEvent::StateMismatchDetected { state_count, runtime_count } => {
                warn!(state_count, runtime_count, "state/runtime count mismatch detected");
            }
            OrchestratorEvent::EngineProvisioned { container_id, vpn_id } => {
                info!(container_id, vpn_id = ?vpn_id, "engine provisioned");
            }
            OrchestratorEvent::EngineStopped { container_id } => {
                info!(container_id, "engine stopped");
            }
        }
    }
}
