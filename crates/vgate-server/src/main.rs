//! vgate gateway - HTTP front door for virtual model serving

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vgate_core::{
    CallbackGroup, GatewayConfig, ProcessSupervisor, VirtualModelManager, SERVER_FAILED_MSG,
    SERVER_STARTED_MSG,
};
use vgate_server::api;
use vgate_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vgate_server=debug,vgate_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting vgate gateway");

    match run().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Keep the failure sentinel on stdout so a supervising parent
            // stops waiting for readiness immediately.
            println!("{SERVER_FAILED_MSG}: {err}");
            Err(err)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();

    let supervisor = Arc::new(ProcessSupervisor::new(Duration::from_secs(
        config.spawn_timeout_secs,
    )));

    let manager = match &config.config_path {
        Some(path) => {
            info!("Loading model config from {}", path.display());
            let source = std::fs::read_to_string(path)?;
            Arc::new(VirtualModelManager::load_from_config(
                &source,
                supervisor.clone(),
            )?)
        }
        None => {
            warn!("No model config supplied; starting with an empty registry");
            Arc::new(VirtualModelManager::new(supervisor.clone()))
        }
    };

    let callbacks = Arc::new(CallbackGroup::from_ids(
        &config.callbacks,
        config.background_callback_limit,
    )?);

    let state = AppState::new(&config, manager, callbacks.clone());
    let app = api::create_router(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on http://{}", addr);

    callbacks
        .on_startup("vgate gateway", &format!("listening on {addr}"))
        .await;

    // Readiness sentinel for a supervising parent scanning our stdout.
    println!("{SERVER_STARTED_MSG}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    callbacks
        .on_shutdown("vgate gateway", "shutting down")
        .await;
    callbacks.wait_background_idle().await;
    state.supervisor.shutdown().await;
    info!("Gateway stopped");

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            warn!("failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => {
                warn!("failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}
