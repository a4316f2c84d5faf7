use std::collections::HashMap;

use async_trait::async_trait;
use bollard::models::{ContainerSummaryStateEnum, ExecConfig, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tokio::time::{sleep, Duration};

use super::{ContainerRuntime, ContainerStats, CreateSpec, ObservedContainer, RuntimeError};

#[derive(Debug, Clone)]
pub struct BollardRuntime {
    client: Docker,
}

impl BollardRuntime {
    pub fn new(socket_path: &str) -> Result<Self, RuntimeError> {
        let client = if socket_path.is_empty() {
            Docker::connect_with_defaults()
        } else {
            let clean = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(clean, 120, &bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| RuntimeError::ConnectionFailed(e.to_string()))?;

        Ok(Self { client })
    }

    fn map_404(err: bollard::errors::Error, container_id: &str) -> RuntimeError {
        match err {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                RuntimeError::ContainerNotFound(container_id.to_string())
            }
            other => RuntimeError::Backend(other),
        }
    }
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn list_labelled(&self, label: &str) -> Result<Vec<ObservedContainer>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let options = Some(ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        });

        let containers = self.client.list_containers(options).await?;
        Ok(containers
            .into_iter()
            .map(|c| {
                let labels = c.labels.unwrap_or_default();
                let host_port = c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .find_map(|p| p.public_port);
                ObservedContainer {
                    id: c.id.unwrap_or_default(),
                    name: c
                        .names
                        .unwrap_or_default()
                        .into_iter()
                        .next()
                        .unwrap_or_default()
                        .trim_start_matches('/')
                        .to_string(),
                    running: matches!(c.state, Some(ContainerSummaryStateEnum::RUNNING)),
                    labels,
                    host_port,
                    // The list endpoint doesn't surface healthcheck status;
                    // only `inspect` does. Callers needing health use that.
                    healthy: None,
                }
            })
            .collect())
    }

    async fn create(&self, spec: CreateSpec) -> Result<String, RuntimeError> {
        let container_port = format!("{}/tcp", spec.http_port);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.http_port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_port, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let config = bollard::models::ContainerCreateBody {
            image: Some(spec.image),
            labels: Some(spec.labels),
            env: Some(
                spec.env
                    .into_iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            ),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: Some(spec.name),
            ..Default::default()
        });

        let result = self
            .client
            .create_container(options, config)
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        self.client
            .start_container(&result.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| Self::map_404(e, &result.id))?;

        Ok(result.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| Self::map_404(e, container_id))
    }

    async fn stop(&self, container_id: &str, timeout_secs: Option<u32>) -> Result<(), RuntimeError> {
        let options = timeout_secs.map(|t| StopContainerOptions {
            t: Some(t as i32),
            ..Default::default()
        });
        self.client
            .stop_container(container_id, options)
            .await
            .map_err(|e| Self::map_404(e, container_id))
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = Some(RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        });
        self.client
            .remove_container(container_id, options)
            .await
            .map_err(|e| Self::map_404(e, container_id))
    }

    async fn inspect(&self, container_id: &str) -> Result<ObservedContainer, RuntimeError> {
        let details = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Self::map_404(e, container_id))?;

        let labels = details
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let running = details
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let host_port = details
            .network_settings
            .as_ref()
            .and_then(|n| n.ports.as_ref())
            .and_then(|ports| ports.values().flatten().next())
            .and_then(|p| p.host_port.as_ref())
            .and_then(|p| p.parse::<u16>().ok());

        // `None` when the image defines no HEALTHCHECK; `Some(false)` covers
        // every non-healthy Docker health state (starting, unhealthy, none).
        let healthy = details
            .state
            .as_ref()
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status.as_ref())
            .map(|status| matches!(status, bollard::models::HealthStatusEnum::HEALTHY));

        Ok(ObservedContainer {
            id: details.id.unwrap_or_else(|| container_id.to_string()),
            name: details
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            running,
            labels,
            host_port,
            healthy,
        })
    }

    async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    async fn stats(&self, ids: &[String]) -> HashMap<String, ContainerStats> {
        let mut out = HashMap::new();
        for id in ids {
            let options = Some(StatsOptions {
                stream: false,
                one_shot: true,
            });
            let mut stream = self.client.stats(id, options);
            let Some(Ok(sample)) = stream.next().await else {
                continue;
            };
            out.insert(id.clone(), Self::convert_stats(sample));
        }
        out
    }

    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<i64, RuntimeError> {
        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd),
            ..Default::default()
        };

        let created = self
            .client
            .create_exec(container_id, config)
            .await
            .map_err(|e| Self::map_404(e, container_id))?;

        let exec_options = Some(bollard::exec::StartExecOptions {
            detach: true,
            ..Default::default()
        });
        self.client
            .start_exec(&created.id, exec_options)
            .await
            .map_err(|e| Self::map_404(e, container_id))?;

        // `start_exec` in attached-output mode returns once the process has
        // finished streaming output; poll inspect briefly for the exit code
        // rather than assuming it's immediately available.
        for _ in 0..20 {
            let inspected = self
                .client
                .inspect_exec(&created.id)
                .await
                .map_err(|e| Self::map_404(e, container_id))?;
            if !inspected.running.unwrap_or(false) {
                return Ok(inspected.exit_code.unwrap_or(0));
            }
            sleep(Duration::from_millis(50)).await;
        }

        Ok(0)
    }
}

impl BollardRuntime {
    fn convert_stats(stats: bollard::models::ContainerStatsResponse) -> ContainerStats {
        let cpu_percent = Self::calculate_cpu_percentage(&stats);
        let memory_usage_bytes = stats.memory_stats.as_ref().and_then(|m| m.usage).unwrap_or(0);
        let memory_limit_bytes = stats.memory_stats.as_ref().and_then(|m| m.limit).unwrap_or(0);

        ContainerStats {
            cpu_percent,
            memory_usage_bytes,
            memory_limit_bytes,
        }
    }

    fn calculate_cpu_percentage(stats: &bollard::models::ContainerStatsResponse) -> f64 {
        let Some(cpu_stats) = &stats.cpu_stats else {
            return 0.0;
        };
        let Some(precpu_stats) = &stats.precpu_stats else {
            return 0.0;
        };

        let cpu_total = cpu_stats.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0);
        let precpu_total = precpu_stats.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0);
        let cpu_delta = cpu_total.saturating_sub(precpu_total) as f64;

        let sys_current = cpu_stats.system_cpu_usage.unwrap_or(0);
        let sys_previous = precpu_stats.system_cpu_usage.unwrap_or(0);
        let system_delta = sys_current.saturating_sub(sys_previous) as f64;

        let online_cpus = cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;

        if system_delta > 0.0 && cpu_delta > 0.0 {
            (cpu_delta / system_delta) * online_cpus * 100.0
        } else {
            0.0
        }
    }
}
