//! Static API-key gate for mutating routes only, applied as a `from_fn`
//! layer on just those routes alongside the router's CORS/timeout/body-limit
//! stack.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::controller::Controller;

/// Accepts `Authorization: Bearer <key>` or `X-API-Key: <key>`. An empty
/// configured key disables the check entirely (local/dev use), matching
/// `SecurityConfig::api_key`'s zero value default.
pub async fn require_api_key(State(controller): State<Arc<Controller>>, req: Request<Body>, next: Next) -> Response {
    let expected = controller.config.security.api_key.as_str();
    if expected.is_empty() {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    if presented == Some(expected) {
        next.run(req).await
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
    }
}
