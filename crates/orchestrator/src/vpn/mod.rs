//! VPN Health Monitor, Emergency-Mode FSM, and the per-VPN forwarded-engine
//! elector. Grouped in one module since the FSM's transitions
//! are driven directly by the health monitor's samples.

pub mod elector;
pub mod fsm;
pub mod health;

pub use elector::ForwardedEngineElector;
pub use fsm::EmergencyModeFsm;
pub use health::VpnHealthMonitor;
