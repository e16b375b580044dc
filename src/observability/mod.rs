//! Observability module for the orchestrator
//!
//! Logging setup lives in [`tracing_config`]; this module owns the
//! Prometheus registry and the standalone metrics listener.

pub mod tracing_config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::StatusCode, routing::get, Router};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

pub use tracing_config::{init_tracing, TracingConfig};

/// Metrics collection
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Webhook metrics
    pub webhooks_received: IntCounter,
    pub webhooks_rejected: IntCounter,
    pub background_tasks_spawned: IntCounter,

    // Recipe run metrics
    pub recipe_runs_created: IntCounter,
    pub recipe_runs_submitted: IntCounter,
    pub recipe_runs_completed: IntCounter,
    pub recipe_runs_failed: IntCounter,

    // Upstream metrics
    pub runner_duration: Histogram,
    pub github_requests: IntCounter,
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric creation failed")
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let webhooks_received = counter(
            "pangeo_forge_webhooks_received_total",
            "Webhook deliveries received",
        );
        let webhooks_rejected = counter(
            "pangeo_forge_webhooks_rejected_total",
            "Webhook deliveries rejected by signature or payload checks",
        );
        let background_tasks_spawned = counter(
            "pangeo_forge_background_tasks_spawned_total",
            "Background tasks spawned from webhooks",
        );
        let recipe_runs_created = counter(
            "pangeo_forge_recipe_runs_created_total",
            "Recipe runs created",
        );
        let recipe_runs_submitted = counter(
            "pangeo_forge_recipe_runs_submitted_total",
            "Recipe runs submitted to a bakery",
        );
        let recipe_runs_completed = counter(
            "pangeo_forge_recipe_runs_completed_total",
            "Recipe runs completed successfully",
        );
        let recipe_runs_failed = counter(
            "pangeo_forge_recipe_runs_failed_total",
            "Recipe runs completed with a failure",
        );

        // Runner invocations clone repositories and talk to cloud APIs
        let runner_duration_opts = HistogramOpts::new(
            "pangeo_forge_runner_duration_seconds",
            "pangeo-forge-runner invocation duration in seconds",
        )
        .buckets(vec![1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]);
        let runner_duration =
            Histogram::with_opts(runner_duration_opts).expect("metric creation failed");

        let github_requests = counter(
            "pangeo_forge_github_requests_total",
            "Requests sent to the GitHub API",
        );

        registry.register(Box::new(webhooks_received.clone())).unwrap();
        registry.register(Box::new(webhooks_rejected.clone())).unwrap();
        registry
            .register(Box::new(background_tasks_spawned.clone()))
            .unwrap();
        registry
            .register(Box::new(recipe_runs_created.clone()))
            .unwrap();
        registry
            .register(Box::new(recipe_runs_submitted.clone()))
            .unwrap();
        registry
            .register(Box::new(recipe_runs_completed.clone()))
            .unwrap();
        registry.register(Box::new(recipe_runs_failed.clone())).unwrap();
        registry.register(Box::new(runner_duration.clone())).unwrap();
        registry.register(Box::new(github_requests.clone())).unwrap();

        Self {
            registry: Arc::new(registry),
            webhooks_received,
            webhooks_rejected,
            background_tasks_spawned,
            recipe_runs_created,
            recipe_runs_submitted,
            recipe_runs_completed,
            recipe_runs_failed,
            runner_duration,
            github_requests,
        }
    }

    /// Encode metrics to Prometheus format
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Router served on the metrics port
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let metrics = metrics.clone();
                async move { (StatusCode::OK, metrics.encode()) }
            }),
        )
        .route("/health", get(|| async { "OK" }))
}

/// Start the metrics server
pub async fn start_metrics_server(addr: SocketAddr, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    tracing::info!(%addr, "Metrics server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, metrics_router(metrics)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        metrics.webhooks_received.inc();
        metrics.recipe_runs_created.inc_by(3);

        let output = metrics.encode();
        assert!(output.contains("pangeo_forge_webhooks_received_total 1"));
        assert!(output.contains("pangeo_forge_recipe_runs_created_total 3"));
    }

    #[test]
    fn test_runner_histogram() {
        let metrics = Metrics::new();
        metrics.runner_duration.observe(4.2);
        metrics.runner_duration.observe(250.0);

        let output = metrics.encode();
        assert!(output.contains("pangeo_forge_runner_duration_seconds_bucket"));
        assert!(output.contains("pangeo_forge_runner_duration_seconds_count 2"));
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.github_requests.inc();
        assert!(b.encode().contains("pangeo_forge_github_requests_total 0"));
    }

    #[tokio::test]
    async fn test_metrics_router() {
        let metrics = Arc::new(Metrics::new());
        metrics.recipe_runs_failed.inc();

        let response = metrics_router(metrics)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("pangeo_forge_recipe_runs_failed_total 1"));
    }
}
