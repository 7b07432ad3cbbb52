pub mod auth;
pub mod health;
pub mod metrics;
pub mod tasks;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Paths reachable without a request signature.
pub const PUBLIC_PATHS: &[&str] = &["/health", "/api/v1/async/health", "/metrics"];

/// Request bodies are small JSON documents; files go straight to storage.
const BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// The signed conversion API.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/async/health", get(health::service_health))
        .route("/api/v1/async/upload-url", post(tasks::create_upload_url))
        .route("/api/v1/async/create-task", post(tasks::create_task))
        .route(
            "/api/v1/async/task/{task_id}",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route(
            "/api/v1/async/download/{task_id}",
            get(tasks::get_download_url),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_signature,
        ))
        .with_state(state)
}

/// Full application: API routes, optional Prometheus scrape endpoint and the
/// HTTP middleware stack.
pub fn app(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let mut router = api_router(state);
    if let Some(handle) = prometheus {
        router = router.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
}
