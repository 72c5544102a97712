//! Conveyor API Server

use anyhow::Context;
use conveyor_api::{AppState, routes};
use conveyor_config::system::LogFormat;
use conveyor_config::{DEFAULT_PIPELINE_FILE, load_pipeline, load_system_config};
use conveyor_core::secret::{SecretStore, SecretValue};
use conveyor_executor::EnvSecretStore;
use conveyor_scheduler::{EventBus, RunOverrides, TriggerQueue, Worker, build_orchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let system_path = std::env::var_os("CONVEYOR_SYSTEM_CONFIG").map(PathBuf::from);
    let config = load_system_config(system_path.as_deref()).context("loading system config")?;
    init_tracing(&config.log_format);

    let pipeline_path = std::env::var_os("CONVEYOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PIPELINE_FILE));
    info!(path = %pipeline_path.display(), "Loading pipeline");
    let pipeline = load_pipeline(&pipeline_path)
        .with_context(|| format!("loading pipeline {}", pipeline_path.display()))?;

    let orchestrator = Arc::new(build_orchestrator(
        pipeline,
        &config,
        RunOverrides::default(),
        EventBus::default(),
    )?);
    let queue = Arc::new(
        TriggerQueue::new(config.history_limit)
            .with_supersede_in_flight(config.supersede_in_flight),
    );

    let mut state = AppState::new(orchestrator.clone(), queue.clone());
    match &config.server.webhook_secret {
        Some(name) => {
            let secrets = EnvSecretStore::from_env(config.secrets.prefix.clone());
            match secrets.get(name).await? {
                SecretValue::String(secret) => state = state.with_webhook_secret(secret),
                SecretValue::Map(_) => anyhow::bail!("webhook secret {} must be a string", name),
            }
        }
        None => warn!("No webhook secret configured, webhook signatures are not checked"),
    }

    let worker = Worker::new("worker-0", queue, orchestrator);
    tokio::spawn(async move { worker.run().await });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.server.bind);
    let listener = TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
