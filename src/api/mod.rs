//! HTTP API for the orchestrator
//!
//! CRUD routes for bakeries, feedstocks, recipe runs and API keys, the
//! GitHub App webhook receiver, and health and metrics endpoints.

pub mod handlers;
pub mod middleware;
pub mod pagination;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::{BakeryRegistry, Environment, Settings};
use crate::db::Database;
use crate::github::GitHubApp;
use crate::observability::Metrics;
use crate::runner::{PangeoForgeRunner, RecipeRunner};
use crate::webhook::{TaskContext, MAX_WEBHOOK_PAYLOAD_SIZE};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub metrics: Arc<Metrics>,
    pub settings: Arc<Settings>,
    pub github: Arc<GitHubApp>,
    pub runner: Arc<dyn RecipeRunner>,
    pub bakeries: Arc<BakeryRegistry>,
}

impl AppState {
    /// Wire up the GitHub client and runner from `settings`
    pub fn new(
        db: Database,
        metrics: Metrics,
        settings: Settings,
        bakeries: BakeryRegistry,
    ) -> anyhow::Result<Self> {
        let github = GitHubApp::new(&settings.github_app)
            .context("Failed to build GitHub App client")?
            .with_request_counter(metrics.github_requests.clone());
        let runner = PangeoForgeRunner::new(&settings.runner)
            .context("Failed to configure pangeo-forge-runner")?
            .with_duration_histogram(metrics.runner_duration.clone());

        Ok(Self {
            db,
            metrics: Arc::new(metrics),
            settings: Arc::new(settings),
            github: Arc::new(github),
            runner: Arc::new(runner),
            bakeries: Arc::new(bakeries),
        })
    }

    /// Swap the recipe runner
    pub fn with_runner(mut self, runner: Arc<dyn RecipeRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Handles cloned out for a background task
    pub fn task_context(&self) -> TaskContext {
        TaskContext {
            db: self.db.clone(),
            github: Arc::clone(&self.github),
            runner: Arc::clone(&self.runner),
            bakeries: Arc::clone(&self.bakeries),
            settings: Arc::clone(&self.settings),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Build the main application router
///
/// Any origin is allowed in development; production mirrors the request
/// origin and limits methods and headers.
pub fn router(state: AppState) -> Router {
    let cors = if state.settings.server.environment == Environment::Production {
        tracing::info!("Production mode: Using restrictive CORS policy");
        CorsLayer::new()
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::HeaderName::from_static("x-api-key"),
                header::HeaderName::from_static("x-request-id"),
            ])
            .allow_origin(tower_http::cors::AllowOrigin::mirror_request())
    } else {
        tracing::info!("Development mode: Using permissive CORS policy");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    #[allow(deprecated)] // TimeoutLayer::new is deprecated but with_status_code is not yet stable
    let timeout_layer = TimeoutLayer::new(Duration::from_secs(30));

    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(timeout_layer)
        .layer(cors);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/live", get(handlers::health::liveness))
        .route("/health/ready", get(handlers::health::readiness))
        .route("/metrics", get(handlers::metrics::prometheus_metrics))
        .merge(crud_router())
        .route(
            "/github/hooks/",
            post(handlers::github_hooks::receive)
                .layer(DefaultBodyLimit::max(MAX_WEBHOOK_PAYLOAD_SIZE)),
        )
        .layer(middleware)
        .with_state(state)
}

/// Bakery, feedstock, recipe run and API key routes
///
/// Reads are public except for API keys; writes take an `AdminKey`.
fn crud_router() -> Router<AppState> {
    use handlers::{api_keys, bakeries, feedstocks, recipe_runs};

    Router::new()
        .route("/api_keys/", get(api_keys::list).post(api_keys::create))
        .route(
            "/api_keys/{id}",
            get(api_keys::get)
                .patch(api_keys::update)
                .delete(api_keys::revoke),
        )
        .route("/bakeries/", get(bakeries::list).post(bakeries::create))
        .route(
            "/bakeries/{id}",
            get(bakeries::get)
                .patch(bakeries::update)
                .delete(bakeries::delete),
        )
        .route("/feedstocks/", get(feedstocks::list).post(feedstocks::create))
        .route(
            "/feedstocks/{id}",
            get(feedstocks::get)
                .patch(feedstocks::update)
                .delete(feedstocks::delete),
        )
        .route(
            "/feedstocks/{id}/{commit_sha}",
            get(feedstocks::meta_at_commit),
        )
        .route(
            "/recipe_runs/",
            get(recipe_runs::list).post(recipe_runs::create),
        )
        .route(
            "/recipe_runs/{id}",
            get(recipe_runs::get)
                .patch(recipe_runs::update)
                .delete(recipe_runs::delete),
        )
}
