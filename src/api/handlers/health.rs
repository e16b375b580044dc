//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::api::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: bool,
}

/// Basic health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_healthy = state.db.health_check().await;

    Json(HealthResponse {
        status: if db_healthy { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database: db_healthy,
    })
}

/// Kubernetes liveness endpoint
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness endpoint
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.db.health_check().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
