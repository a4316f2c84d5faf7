//! Request handlers. Each reads `Controller`'s subsystems and returns; none
//! hold `State`'s lock across an `.await`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::circuit_breaker::CircuitState;
use crate::controller::Controller;
use crate::error::{ApiError, BlockedReasonCode, BlockedReasonDetails, OrchestratorError};
use crate::state::{Health, Stream, StreamEndedEvent, StreamStartedEvent, StreamStatus};

use super::dto::{CapacityStatus, EngineCounts, EngineDto, EngineWithStreams, OrchestratorStatus, ProvisioningStatus, StreamCounts, VpnStatusSummary};

pub async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok", "timestamp": Utc::now().to_rfc3339()}))
}

pub async fn ready_handler(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    let ready = controller.is_ready();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({"ready": ready})))
}

pub async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "name": "acestream-orchestrator",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "engines": "/engines",
            "status": "/orchestrator/status",
            "vpn_status": "/vpn/status",
            "health": "/health",
            "ready": "/ready",
        }
    }))
}

/// `GET /engines` — filtered to engines whose VPN is currently known
/// healthy (engines on a VPN we've never sampled, or that has no VPN at
/// all, are included).
pub async fn list_engines_handler(State(controller): State<Arc<Controller>>) -> Json<Vec<EngineDto>> {
    let engines = controller.state.list_engines();
    let filtered = engines.into_iter().filter(|e| match (&e.vpn_id, &controller.vpn_health) {
        (Some(vpn_id), Some(monitor)) => monitor.last_known(vpn_id).unwrap_or(true),
        _ => true,
    });
    Json(
        filtered
            .map(|e| {
                let stats = controller.stats.latest(&e.id);
                EngineDto::from(e).with_stats(stats)
            })
            .collect(),
    )
}

pub async fn get_engine_handler(State(controller): State<Arc<Controller>>, Path(id): Path<String>) -> Result<Json<EngineWithStreams>, ApiError> {
    let engine = controller.state.get_engine(&id).ok_or_else(|| OrchestratorError::NotFound(format!("engine '{id}' not found")))?;
    let stream_details: Vec<Stream> = controller.state.list_streams(None, Some(&id));
    let stats = controller.stats.latest(&id);
    Ok(Json(EngineWithStreams {
        engine: EngineDto::from(engine).with_stats(stats),
        stream_details,
    }))
}

pub async fn provision_handler(State(controller): State<Arc<Controller>>) -> Result<impl IntoResponse, ApiError> {
    let resp = controller.autoscaler.provision_one().await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"container_id": resp.container_id, "host_http_port": resp.host_http_port})),
    ))
}

pub async fn stop_container_handler(State(controller): State<Arc<Controller>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    controller
        .provisioner
        .stop_engine(&id)
        .await
        .map_err(|e| OrchestratorError::ProvisionFailed(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn scale_handler(State(controller): State<Arc<Controller>>, Path(n): Path<usize>) -> impl IntoResponse {
    let outcome = controller.autoscaler.scale_to(n).await;
    Json(json!({"provisioned": outcome.provisioned, "stopped": outcome.stopped, "failed": outcome.failed}))
}

pub async fn gc_handler(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    let stopped = controller.run_gc().await;
    Json(json!({"stopped": stopped}))
}

pub async fn stream_started_handler(State(controller): State<Arc<Controller>>, Json(evt): Json<StreamStartedEvent>) -> impl IntoResponse {
    let stream = controller.state.on_stream_started(evt);
    controller.autoscaler.maybe_lookahead_provision().await;
    (StatusCode::CREATED, Json(stream))
}

pub async fn stream_ended_handler(State(controller): State<Arc<Controller>>, Json(evt): Json<StreamEndedEvent>) -> Result<impl IntoResponse, ApiError> {
    match controller.state.on_stream_ended(evt) {
        Some(outcome) => Ok(Json(json!({
            "stream_id": outcome.stream.id,
            "engine_became_idle": outcome.engine_became_idle,
        }))),
        None => Err(OrchestratorError::NotFound("stream not found".to_string()).into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamsQuery {
    pub status: Option<String>,
}

pub async fn list_streams_handler(State(controller): State<Arc<Controller>>, Query(q): Query<StreamsQuery>) -> Result<Json<Vec<Stream>>, ApiError> {
    let status = match q.status.as_deref() {
        Some("started") => Some(StreamStatus::Started),
        Some("ended") => Some(StreamStatus::Ended),
        Some(other) => return Err(OrchestratorError::InvalidRequest(format!("unknown status filter '{other}'")).into()),
        None => None,
    };
    Ok(Json(controller.state.list_streams(status, None)))
}

fn circuit_state_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

fn blocked_reason_label(code: BlockedReasonCode) -> &'static str {
    match code {
        BlockedReasonCode::VpnDisconnected => "vpn_disconnected",
        BlockedReasonCode::CircuitBreaker => "circuit_breaker",
        BlockedReasonCode::MaxCapacity => "max_capacity",
    }
}

pub async fn orchestrator_status_handler(State(controller): State<Arc<Controller>>) -> Json<OrchestratorStatus> {
    let validation = controller.validator.validation_status().await;
    let breaker_status = controller.breaker.status();
    let general = breaker_status.get("general").cloned();

    let state_engines = controller.state.list_engines();
    let healthy = state_engines.iter().filter(|e| e.health == Health::Healthy).count();
    let unhealthy = state_engines.iter().filter(|e| e.health == Health::Unhealthy).count();

    let active_streams = controller.state.list_streams(Some(StreamStatus::Started), None).len();
    let total_streams = controller.state.list_streams(None, None).len();

    let max_replicas = controller.config.replicas.max_replicas;
    let min_replicas = controller.config.replicas.min_replicas;
    let capacity_reached = validation.runtime_running >= max_replicas;

    let vpn_enabled = controller.config.vpn.is_configured();
    let primary_vpn = controller.config.vpn.gluetun_container_name.clone();
    let (vpn_connected, vpn_health_label, forwarded_port) = if vpn_enabled {
        let connected = primary_vpn
            .as_deref()
            .and_then(|id| controller.vpn_health.as_ref().and_then(|m| m.last_known(id)))
            .unwrap_or(false);
        let forwarded = primary_vpn.as_deref().and_then(|vpn_key| controller.state.get_forwarded_engine_for_vpn(vpn_key));
        (connected, if connected { "healthy" } else { "unhealthy" }.to_string(), forwarded.map(|e| e.http_port))
    } else {
        (true, "disabled".to_string(), None)
    };

    let breaker_open = general.as_ref().map(|g| matches!(g.state, CircuitState::Open)).unwrap_or(false);
    let can_provision = !breaker_open && !capacity_reached && (!vpn_enabled || vpn_connected);

    let (blocked_reason, blocked_reason_details) = if !can_provision {
        let details = if vpn_enabled && !vpn_connected {
            BlockedReasonDetails {
                code: BlockedReasonCode::VpnDisconnected,
                message: "vpn disconnected".to_string(),
                recovery_eta_seconds: None,
                can_retry: true,
                should_wait: true,
            }
        } else if breaker_open {
            BlockedReasonDetails {
                code: BlockedReasonCode::CircuitBreaker,
                message: "circuit breaker open, provisioning paused".to_string(),
                recovery_eta_seconds: general.as_ref().map(|g| g.recovery_timeout_secs),
                can_retry: true,
                should_wait: true,
            }
        } else {
            BlockedReasonDetails {
                code: BlockedReasonCode::MaxCapacity,
                message: format!("at max_replicas ({max_replicas})"),
                recovery_eta_seconds: None,
                can_retry: false,
                should_wait: false,
            }
        };
        (Some(blocked_reason_label(details.code).to_string()), Some(details))
    } else {
        (None, None)
    };

    let status = if !validation.docker_available {
        "unavailable"
    } else if !validation.state_consistent || breaker_open || controller.state.is_emergency_mode() {
        "degraded"
    } else {
        "healthy"
    };

    Json(OrchestratorStatus {
        status: status.to_string(),
        engines: EngineCounts {
            total: validation.state_engines,
            running: validation.runtime_running,
            healthy,
            unhealthy,
        },
        streams: StreamCounts {
            active: active_streams,
            total: total_streams,
        },
        capacity: CapacityStatus {
            total: validation.state_engines,
            used: validation.used_engines,
            available: validation.free_engines,
            max_replicas,
            min_replicas,
        },
        vpn: VpnStatusSummary {
            enabled: vpn_enabled,
            connected: vpn_connected,
            health: vpn_health_label,
            container: primary_vpn,
            forwarded_port,
        },
        provisioning: ProvisioningStatus {
            can_provision,
            circuit_breaker_state: general.map(|g| circuit_state_label(g.state).to_string()).unwrap_or_else(|| "closed".to_string()),
            last_failure: breaker_status.get("general").and_then(|g| g.last_failure_at),
            blocked_reason,
            blocked_reason_details,
        },
        timestamp: Utc::now(),
    })
}

pub async fn vpn_status_handler(State(controller): State<Arc<Controller>>) -> Json<serde_json::Value> {
    if !controller.config.vpn.is_configured() {
        return Json(json!({"enabled": false}));
    }

    let mut vpns = Vec::new();
    for name in [&controller.config.vpn.gluetun_container_name, &controller.config.vpn.gluetun_container_name_2] {
        if let Some(name) = name {
            let healthy = controller.vpn_health.as_ref().and_then(|m| m.last_known(name));
            let forwarded = controller.state.get_forwarded_engine_for_vpn(name);
            vpns.push(json!({
                "container": name,
                "health": match healthy {
                    Some(true) => "healthy",
                    Some(false) => "unhealthy",
                    None => "unknown",
                },
                "forwarded_port": forwarded.map(|e| e.http_port),
                "engine_count": controller.state.engines_by_vpn(name).len(),
            }));
        }
    }

    Json(json!({
        "enabled": true,
        "mode": format!("{:?}", controller.config.vpn.mode).to_lowercase(),
        "emergency_mode": controller.state.is_emergency_mode(),
        "emergency": controller.state.emergency_mode_info(),
        "vpns": vpns,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResetQuery {
    pub operation_type: Option<String>,
}

pub async fn reset_circuit_breaker_handler(State(controller): State<Arc<Controller>>, Query(q): Query<ResetQuery>) -> impl IntoResponse {
    controller.breaker.force_reset(q.operation_type.as_deref());
    Json(json!({"status": "reset", "operation_type": q.operation_type}))
}
