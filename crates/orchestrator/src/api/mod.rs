//! Axum router assembly and request handlers: a `ServiceBuilder` layering
//! timeout/body-limit/CORS around a plain `Router`, with the mutating
//! routes additionally gated by the API-key middleware.

pub mod auth;
pub mod dto;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method, StatusCode};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use crate::controller::Controller;

pub fn build_router(controller: Arc<Controller>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::HeaderName::from_static("x-api-key")]);

    // Mutating routes require the API key; read-only routes
    // are reachable without one.
    let guarded = Router::new()
        .route("/provision/acestream", post(handlers::provision_handler))
        .route("/containers/{id}", delete(handlers::stop_container_handler))
        .route("/scale/{n}", post(handlers::scale_handler))
        .route("/gc", post(handlers::gc_handler))
        .route("/events/stream_started", post(handlers::stream_started_handler))
        .route("/events/stream_ended", post(handlers::stream_ended_handler))
        .route("/health/circuit-breaker/reset", post(handlers::reset_circuit_breaker_handler))
        .layer(middleware::from_fn_with_state(controller.clone(), auth::require_api_key));

    let open = Router::new()
        .route("/", get(handlers::root_handler))
        .route("/health", get(handlers::health_handler))
        .route("/ready", get(handlers::ready_handler))
        .route("/engines", get(handlers::list_engines_handler))
        .route("/engines/{id}", get(handlers::get_engine_handler))
        .route("/streams", get(handlers::list_streams_handler))
        .route("/orchestrator/status", get(handlers::orchestrator_status_handler))
        .route("/vpn/status", get(handlers::vpn_status_handler));

    open.merge(guarded).layer(
        ServiceBuilder::new()
            .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(30)))
            .layer(DefaultBodyLimit::max(1024 * 1024))
            .layer(cors),
    )
        .with_state(controller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::runtime::{ContainerRuntime, FakeRuntime};

    fn test_controller(api_key: &str) -> Arc<Controller> {
        let mut config = Config::default();
        config.security.api_key = api_key.to_string();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::new());
        Controller::bootstrap(config, runtime)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_is_reachable_without_auth() {
        let app = build_router(test_controller("secret"));
        let response = app
            .oneshot(Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mutating_route_without_api_key_is_rejected() {
        let app = build_router(test_controller("secret"));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/gc")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn mutating_route_with_correct_api_key_succeeds() {
        let app = build_router(test_controller("secret"));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/gc")
                    .header("x-api-key", "secret")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn orchestrator_status_reports_empty_fleet() {
        let app = build_router(test_controller(""));
        let response = app
            .oneshot(Request::builder().uri("/orchestrator/status").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["capacity"]["total"], 0);
        assert_eq!(json["status"], "healthy");
    }
}
