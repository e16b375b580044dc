//! Metrics handler for Prometheus scraping

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::api::AppState;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus metrics endpoint
///
/// Same registry as the dedicated metrics port, for deployments that only
/// expose the API port.
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.encode(),
    )
}
