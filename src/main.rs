//! Pangeo Forge Orchestrator
//!
//! Receives GitHub App webhooks, records recipe runs in Postgres and hands
//! bakes to `pangeo-forge-runner`.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use pangeo_forge_orchestrator::api;
use pangeo_forge_orchestrator::config::{BakeryRegistry, Settings};
use pangeo_forge_orchestrator::db::Database;
use pangeo_forge_orchestrator::observability::{self, Metrics, TracingConfig};

/// Graceful shutdown timeout (max time to wait for in-flight requests)
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let settings = Settings::load()?;

    observability::init_tracing(&TracingConfig::from_settings(&settings));

    info!(
        "Starting Pangeo Forge Orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        host = %settings.server.host,
        port = %settings.server.port,
        environment = %settings.server.environment,
        "Configuration loaded"
    );

    if settings.github_app.webhook_secret.is_none() {
        warn!("GITHUB_WEBHOOK_SECRET is not set, webhook deliveries will be refused");
    }
    if settings.github_app.private_key.is_none() {
        warn!("No GitHub App private key configured, GitHub calls will fail");
    }

    let bakeries = BakeryRegistry::load_dir(&settings.runner.bakeries_dir)?;

    let db = Database::connect(&settings.database).await?;
    db.run_migrations().await?;

    let metrics = Metrics::new();
    info!("Prometheus metrics initialized");

    let state = api::AppState::new(db.clone(), metrics, settings.clone(), bakeries)?;
    let app = api::router(state.clone());

    let addr = SocketAddr::new(settings.server.host.parse()?, settings.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Server listening");

    // Dedicated metrics listener
    let metrics_addr = SocketAddr::new(settings.server.host.parse()?, settings.server.metrics_port);
    let metrics = state.metrics.clone();
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = observability::start_metrics_server(metrics_addr, metrics).await {
            error!(error = %e, "Metrics server error");
        }
    });
    info!(%metrics_addr, "Metrics server listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .into_future();
    tokio::pin!(server);

    // Bound the drain so a stuck connection cannot hold the process open
    tokio::select! {
        result = &mut server => result?,
        _ = async {
            let _ = shutdown_rx.changed().await;
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        } => {
            warn!(
                "Shutdown timeout ({:?}) exceeded, forcing exit",
                SHUTDOWN_TIMEOUT
            );
        }
    }

    info!("HTTP server stopped");

    metrics_handle.abort();

    db.close().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (Ctrl+C or SIGTERM)
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    let _ = shutdown_tx.send(true);
}
