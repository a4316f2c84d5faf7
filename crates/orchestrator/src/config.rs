//! Layered configuration: compiled-in defaults -> TOML file -> environment
//! variables (prefix `ORCH`, `__` nesting separator) -> `.env`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub replicas: ReplicaConfig,
    pub lifecycle: LifecycleConfig,
    pub monitor: MonitorConfig,
    pub vpn: VpnConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub ports: PortsConfig,
    pub runtime: RuntimeConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

/// `MIN_REPLICAS` / `MIN_FREE_REPLICAS` / `MAX_REPLICAS` / `MAX_ACTIVE_REPLICAS`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicaConfig {
    pub min_replicas: usize,
    pub min_free_replicas: usize,
    pub max_replicas: usize,
    /// Hard cap when a VPN is configured; `None` means unlimited.
    pub max_active_replicas: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    pub engine_grace_period_s: u64,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    pub monitor_interval_s: u64,
    pub autoscale_interval_s: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VpnMode {
    None,
    Single,
    Redundant,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VpnConfig {
    pub mode: VpnMode,
    pub gluetun_container_name: Option<String>,
    pub gluetun_container_name_2: Option<String>,
    pub health_sample_interval_s: u64,
    /// Stabilization window for `RECOVERY -> NORMAL`: exit early on
    /// per-VPN parity, or after this elapses regardless.
    pub recovery_stabilization_s: u64,
}

impl VpnConfig {
    pub fn is_redundant(&self) -> bool {
        self.mode == VpnMode::Redundant
    }

    pub fn is_configured(&self) -> bool {
        self.mode != VpnMode::None
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    pub general_failure_threshold: u32,
    pub general_recovery_timeout_s: u64,
    pub replacement_failure_threshold: u32,
    pub replacement_recovery_timeout_s: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortsConfig {
    pub regular_range_start: u16,
    pub regular_range_end: u16,
    pub forwarded_range_start: u16,
    pub forwarded_range_end: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    pub image: String,
    pub docker_socket: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "0.0.0.0:8090".to_string(),
            },
            replicas: ReplicaConfig {
                min_replicas: 3,
                min_free_replicas: 2,
                max_replicas: 20,
                max_active_replicas: None,
            },
            lifecycle: LifecycleConfig {
                engine_grace_period_s: 30,
                auto_delete: true,
            },
            monitor: MonitorConfig {
                monitor_interval_s: 5,
                autoscale_interval_s: 15,
            },
            vpn: VpnConfig {
                mode: VpnMode::None,
                gluetun_container_name: None,
                gluetun_container_name_2: None,
                health_sample_interval_s: 10,
                recovery_stabilization_s: 120,
            },
            circuit_breaker: CircuitBreakerConfig {
                general_failure_threshold: 5,
                general_recovery_timeout_s: 300,
                replacement_failure_threshold: 3,
                replacement_recovery_timeout_s: 180,
            },
            ports: PortsConfig {
                regular_range_start: 40000,
                regular_range_end: 40999,
                forwarded_range_start: 41000,
                forwarded_range_end: 41099,
            },
            runtime: RuntimeConfig {
                image: "acestream/engine:latest".to_string(),
                docker_socket: String::new(),
            },
            security: SecurityConfig {
                api_key: String::new(),
            },
            logging: LoggingConfig {
                level: "info,orchestrator=debug".to_string(),
                format: LogFormat::Pretty,
            },
        }
    }
}

impl Config {
    /// Layers compiled-in defaults, then `/etc/acestream-orchestrator/config.toml`,
    /// then `config/orchestrator.toml` (local dev), then `ORCH__`-prefixed
    /// environment variables, file values taking precedence over compiled-in
    /// defaults and env values taking precedence over the file.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&Config::default()).context("failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        for path in [
            "/etc/acestream-orchestrator/config",
            "config/orchestrator",
            "crates/orchestrator/config/orchestrator",
        ] {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("ORCH").separator("__").try_parsing(true));

        builder.build().context("failed to build configuration")?.try_deserialize().context("failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        self.server.bind_address.parse::<std::net::SocketAddr>().context("invalid server.bind_address")?;

        if self.monitor.monitor_interval_s == 0 {
            bail!("monitor.monitor_interval_s must be positive");
        }
        if self.monitor.autoscale_interval_s == 0 {
            bail!("monitor.autoscale_interval_s must be positive");
        }
        if self.replicas.max_replicas < self.replicas.min_replicas {
            bail!("replicas.max_replicas must be >= replicas.min_replicas");
        }
        if self.ports.regular_range_start > self.ports.regular_range_end {
            bail!("ports.regular_range_start must be <= regular_range_end");
        }
        if self.ports.forwarded_range_start > self.ports.forwarded_range_end {
            bail!("ports.forwarded_range_start must be <= forwarded_range_end");
        }

        match self.vpn.mode {
            VpnMode::None => {}
            VpnMode::Single => {
                if self.vpn.gluetun_container_name.is_none() {
                    bail!("vpn.mode = single requires vpn.gluetun_container_name");
                }
            }
            VpnMode::Redundant => {
                if self.vpn.gluetun_container_name.is_none() || self.vpn.gluetun_container_name_2.is_none() {
                    bail!("vpn.mode = redundant requires both vpn.gluetun_container_name and vpn.gluetun_container_name_2");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn redundant_mode_without_second_container_fails_validation() {
        let mut cfg = Config::default();
        cfg.vpn.mode = VpnMode::Redundant;
        cfg.vpn.gluetun_container_name = Some("vpn-a".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_replicas_below_min_fails_validation() {
        let mut cfg = Config::default();
        cfg.replicas.max_replicas = 1;
        cfg.replicas.min_replicas = 5;
        assert!(cfg.validate().is_err());
    }
}
