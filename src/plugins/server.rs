use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::api::{self, AppState};
use super::db::{DbHandle, PluginDb};
use super::docker::DockerRuntime;
use super::events::EventBus;
use super::orchestrator::{Orchestrator, OrchestratorSettings};
use super::registry::RegistryClient;
use super::ws;
use crate::config::FlowforgeConfig;

/// How often a server that started without an engine retries the boot.
const BOOT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Build the full application router: REST API plus the event socket.
pub fn build_router(state: Arc<AppState>, cors: bool) -> Router {
    let mut app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Wire the store, engine, registry and orchestrator together and serve
/// until Ctrl+C. Running plugin containers are left running on exit.
pub async fn start_server(config: FlowforgeConfig) -> Result<()> {
    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
    }

    if let Some(parent) = config.server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(
        PluginDb::new(&config.server.db_path).context("Failed to initialize plugin database")?,
    );

    let runtime = Arc::new(
        DockerRuntime::connect(config.docker.socket.as_deref())
            .context("Failed to configure Docker client")?,
    );
    let registry = Arc::new(
        RegistryClient::new(db.clone(), &config.registry)
            .context("Failed to configure registry client")?,
    );
    if let Err(e) = registry.seed_sources(&config.registry.sources).await {
        warn!(error = %e, "Failed to seed registry sources");
    }

    let orchestrator = Orchestrator::new(
        db,
        runtime,
        registry.clone(),
        EventBus::default(),
        OrchestratorSettings::from(&config),
    );
    if !orchestrator.boot().await {
        spawn_boot_retry(Arc::clone(&orchestrator));
    }

    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
        registry,
    });
    let app = build_router(state, config.server.cors);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "FlowForge server listening");
    println!("FlowForge running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    orchestrator.shutdown();
    info!("Server shut down gracefully");
    Ok(())
}

/// Keep pinging the engine until the orchestrator becomes ready.
fn spawn_boot_retry(orchestrator: Arc<Orchestrator>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(BOOT_RETRY_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if orchestrator.is_ready() || orchestrator.boot().await {
                break;
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
