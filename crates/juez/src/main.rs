//! juez - Code Judge Service
//!
//! Serves the grading API: compiles learner submissions against reference
//! harnesses and runs them in a sandbox.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use juez::config::{Config, LogFormat};
use juez::janitor::Janitor;
use juez::server::{AppState, create_router};
use juez::{CancelHandle, Grader, Registry, cancel_pair, metrics, sandbox};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    let json = config.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "juez=debug,tower_http=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    tracing::info!("Starting juez code judge");
    tracing::info!("Environment: {}", config.environment);

    metrics::init_metrics();

    let registry = Arc::new(
        Registry::load(&config.registry.tests_paths).context("Failed to load exercises")?,
    );

    let workspace_root = &config.storage.workspace_root;
    std::fs::create_dir_all(workspace_root)
        .with_context(|| format!("Failed to create workspace root {}", workspace_root.display()))?;
    sandbox::probe(&config.sandbox, workspace_root).await;

    let janitor = Arc::new(Janitor::new(
        workspace_root,
        Duration::from_secs(config.janitor.stale_after_minutes * 60),
    ));
    janitor.sweep().await;
    let mut scheduler = janitor
        .clone()
        .schedule(&config.janitor.schedule)
        .await
        .context("Failed to schedule workspace sweeps")?;

    let grader = Arc::new(Grader::from_config(&config, registry));
    let (shutdown_handle, shutdown) = cancel_pair();
    let app = create_router(AppState::new(grader, shutdown));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid HOST/PORT")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_handle))
        .await?;

    scheduler.shutdown().await?;
    tracing::info!("juez shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM, cancelling in-flight attempts first.
async fn shutdown_signal(handle: CancelHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, cancelling in-flight attempts...");
    handle.cancel();
}
