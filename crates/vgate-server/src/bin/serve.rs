//! vgate-serve - single-model serving entrypoint.
//!
//! Launched by the gateway's process supervisor with one model to host.
//! Registers that model, exposes the same HTTP surface as the gateway on
//! the requested port, and prints a readiness sentinel on stdout that
//! the parent's spawn loop scans for. Backend adapters are attached by
//! the embedding application; until one is, data-plane routes answer
//! with the usual not-started envelope.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vgate_core::{
    CallbackGroup, Capability, CapabilitySet, DynamicRegistration, GatewayConfig, Locality,
    ProcessSupervisor, ServeOptions, VirtualModelManager, SERVER_FAILED_MSG, SERVER_STARTED_MSG,
};
use vgate_server::api;
use vgate_server::state::AppState;

/// Serve a single model over HTTP.
#[derive(Debug, Parser)]
#[command(name = "vgate-serve")]
struct ServeArgs {
    /// Virtual model name. Falls back to the SERVE_NAME environment bag.
    name: Option<String>,

    /// Upstream model identifier, defaults to the model name.
    #[arg(long)]
    model_id: Option<String>,

    /// Onboarding method recorded for this model (config | dynamic).
    #[arg(long)]
    method: Option<String>,

    /// Model task type (chat | embedding | rerank | tokenize | transcribe).
    #[arg(long = "type")]
    model_type: Option<String>,

    /// Bind host.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port.
    #[arg(long, default_value_t = 8001)]
    port: u16,

    /// Bearer token required on every route.
    #[arg(long)]
    api_key: Option<String>,

    /// Backend adapter hint passed through to the adapter layer.
    #[arg(long)]
    backend: Option<String>,

    /// Let the adapter spread weights across available devices.
    #[arg(long, default_value_t = false)]
    device_map_auto: bool,
}

impl ServeArgs {
    /// CLI values win; anything absent falls back to the SERVE_* env bag.
    fn into_options(self) -> anyhow::Result<(ServeOptions, String, u16)> {
        let env = ServeOptions::from_env();
        let name = match (self.name, env) {
            (Some(name), _) => name,
            (None, Ok(env_opts)) => env_opts.name,
            (None, Err(err)) => anyhow::bail!("no model name given: {err}"),
        };
        // Re-read the bag so CLI and env merge field by field.
        let options = ServeOptions {
            model_id: self.model_id.unwrap_or_else(|| {
                std::env::var("SERVE_MODEL_ID")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| name.clone())
            }),
            method: self.method.unwrap_or_else(|| {
                std::env::var("SERVE_METHOD").unwrap_or_else(|_| "config".into())
            }),
            model_type: self
                .model_type
                .or_else(|| std::env::var("SERVE_TYPE").ok().filter(|s| !s.is_empty())),
            backend: self.backend.unwrap_or_else(|| {
                std::env::var("SERVE_BACKEND").unwrap_or_else(|_| "torch".into())
            }),
            device_map_auto: self.device_map_auto
                || std::env::var("SERVE_DEVICE_MAP_AUTO")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            api_key: self
                .api_key
                .or_else(|| std::env::var("SERVE_API_KEY").ok().filter(|s| !s.is_empty())),
            name,
        };
        Ok((options, self.host, self.port))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vgate_serve=debug,vgate_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = ServeArgs::parse();

    match run(args).await {
        Ok(()) => Ok(()),
        Err(err) => {
            println!("{SERVER_FAILED_MSG}: {err}");
            Err(err)
        }
    }
}

async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let (options, host, port) = args.into_options()?;
    info!("Serving model '{}' ({})", options.name, options.model_id);

    let mut config = GatewayConfig::from_env();
    config.host = host;
    config.port = port;
    config.api_key = options.api_key.clone();

    let supervisor = Arc::new(ProcessSupervisor::new(Duration::from_secs(
        config.spawn_timeout_secs,
    )));
    let manager = Arc::new(VirtualModelManager::new(supervisor));

    let capabilities: CapabilitySet = match &options.model_type {
        Some(raw) => {
            let capability = Capability::from_str(raw)
                .map_err(|err| anyhow::anyhow!("invalid --type: {err}"))?;
            [capability].into_iter().collect()
        }
        None => [Capability::Chat].into_iter().collect(),
    };

    manager
        .register_dynamic(DynamicRegistration {
            name: options.name.clone(),
            model_id: Some(options.model_id.clone()),
            capabilities,
            locality: Locality::InProcess,
            backend_params: serde_json::json!({
                "backend": options.backend,
                "device_map_auto": options.device_map_auto,
                "method": options.method,
            }),
            port: None,
        })
        .await?;

    let callbacks = Arc::new(CallbackGroup::from_ids(
        &config.callbacks,
        config.background_callback_limit,
    )?);
    let state = AppState::new(&config, manager, callbacks.clone());
    let app = api::create_router(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Serving '{}' on http://{}", options.name, addr);

    callbacks
        .on_startup(&options.name, &format!("serving on {addr}"))
        .await;

    // The parent supervisor blocks on this line.
    println!("{SERVER_STARTED_MSG}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    callbacks.on_shutdown(&options.name, "shutting down").await;
    callbacks.wait_background_idle().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
