//! Error taxonomy: kinds, not type names. Periodic tasks never
//! propagate these past their own loop iteration — they log and return.
//! The HTTP API boundary is the only place an `OrchestratorError` becomes a
//! status code and JSON body, via `ApiError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

/// The structured detail carried by a blocked-provision response, matching
/// `/orchestrator/status`'s `provisioning.blocked_reason_details` shape.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedReasonDetails {
    pub code: BlockedReasonCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_eta_seconds: Option<u64>,
    pub can_retry: bool,
    pub should_wait: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedReasonCode {
    VpnDisconnected,
    CircuitBreaker,
    MaxCapacity,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The container runtime adapter is unreachable. Recovered locally by
    /// degrading to last-known-good and retrying next tick — never fatal.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// One of VPN-disconnected, circuit-breaker-open, max-capacity.
    #[error("provisioning blocked: {}", .0.message)]
    ProvisionBlocked(BlockedReasonDetails),

    /// The runtime returned an error from `create`. Counted by the breaker.
    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    /// Detected by Reindex (port double-reservation, two forwarded engines
    /// on one VPN); repaired in place, this variant only carries the log.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Counts disagree with the runtime; triggers a single coordinated
    /// Reindex, never a cascade.
    #[error("state mismatch: state reports {state_count}, runtime reports {runtime_count}")]
    StateMismatch { state_count: usize, runtime_count: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// API-boundary wrapper: the only place `OrchestratorError` turns into an
/// HTTP status and JSON body.
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked_reason_details: Option<BlockedReasonDetails>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            OrchestratorError::RuntimeUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    error: msg.clone(),
                    blocked_reason: None,
                    blocked_reason_details: None,
                },
            ),
            OrchestratorError::ProvisionBlocked(details) => (
                match details.code {
                    BlockedReasonCode::MaxCapacity => StatusCode::UNPROCESSABLE_ENTITY,
                    _ => StatusCode::SERVICE_UNAVAILABLE,
                },
                ErrorBody {
                    error: details.message.clone(),
                    blocked_reason: Some(format!("{:?}", details.code)),
                    blocked_reason_details: Some(details.clone()),
                },
            ),
            OrchestratorError::ProvisionFailed(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    error: msg.clone(),
                    blocked_reason: None,
                    blocked_reason_details: None,
                },
            ),
            OrchestratorError::InvariantViolation(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    error: msg.clone(),
                    blocked_reason: None,
                    blocked_reason_details: None,
                },
            ),
            OrchestratorError::StateMismatch { state_count, runtime_count } => (
                StatusCode::CONFLICT,
                ErrorBody {
                    error: format!("state reports {state_count} engines, runtime reports {runtime_count}"),
                    blocked_reason: None,
                    blocked_reason_details: None,
                },
            ),
            OrchestratorError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: msg.clone(),
                    blocked_reason: None,
                    blocked_reason_details: None,
                },
            ),
            OrchestratorError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "unauthorized".to_string(),
                    blocked_reason: None,
                    blocked_reason_details: None,
                },
            ),
            OrchestratorError::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: msg.clone(),
                    blocked_reason: None,
                    blocked_reason_details: None,
                },
            ),
        };

        (status, Json(body)).into_response()
    }
}
