use chrono::{DateTime, Utc};
use serde::Serialize;

/// Redundant-VPN degraded mode: one VPN has failed, engines on it were torn
/// down, and only the healthy VPN's engines remain in `State`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmergencyMode {
    pub active: bool,
    pub failed_vpn: Option<String>,
    pub healthy_vpn: Option<String>,
    pub entered_at: Option<DateTime<Utc>>,
}

/// System-wide pause used to coordinate a bulk reprovisioning operation.
/// While active, `Autoscaler::ensure_minimum(false)` is a no-op.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReprovisioningMode {
    pub active: bool,
    pub entered_at: Option<DateTime<Utc>>,
}

/// Transient mode after a failed VPN recovers: new engines are directed to
/// `target_vpn` until per-VPN engine counts approach parity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VpnRecoveryMode {
    pub active: bool,
    pub target_vpn: Option<String>,
    pub entered_at: Option<DateTime<Utc>>,
}

/// Per-VPN health bookkeeping used by the FSM to decide stabilization.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VpnHealth {
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub last_unhealthy_at: Option<DateTime<Utc>>,
    pub recovery_stabilization_until: Option<DateTime<Utc>>,
}
