use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::services::converter::SUPPORTED_EXTENSIONS;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthChecks {
    pub queue: ComponentHealth,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealthResponse {
    #[serde(flatten)]
    pub health: HealthResponse,
    pub service: String,
    pub queue_depth: Option<u64>,
    pub supported_formats: Vec<String>,
}

async fn check_queue(state: &AppState) -> ComponentHealth {
    let start = std::time::Instant::now();
    match state.queue.health_check().await {
        Ok(()) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Queue health check failed");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    }
}

async fn health(state: &AppState) -> (StatusCode, HealthResponse) {
    let queue = check_queue(state).await;
    let healthy = queue.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { queue },
    };
    (status_code, response)
}

/// GET /health: process liveness plus queue reachability.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (status, response) = health(&state).await;
    (status, Json(response))
}

/// GET /api/v1/async/health: conversion service view, with the formats the
/// worker accepts.
pub async fn service_health(
    State(state): State<AppState>,
) -> (StatusCode, Json<ServiceHealthResponse>) {
    let (status, health) = health(&state).await;

    let queue_depth = match state.queue.depth().await {
        Ok(depth) => {
            metrics::gauge!("conversion_queue_depth").set(depth as f64);
            Some(depth)
        }
        Err(_) => None,
    };

    let response = ServiceHealthResponse {
        health,
        service: "async-markdown-converter".to_string(),
        queue_depth,
        supported_formats: SUPPORTED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
    };
    (status, Json(response))
}
