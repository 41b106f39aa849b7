#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod api;
mod auth;
mod config;

use anyhow::Context;
use api::AppState;
use config::{LogFormat, ServerConfig};
use std::sync::Arc;
use streamgate_core::StreamInterruptRegistry;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,streamgate_server=debug,streamgate_core=debug";

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load()?;
    init_tracing(config.log_format);

    tracing::info!(
        provider = %config.inference.provider,
        model = config.inference.model_or_default(),
        "Starting streamgate server"
    );

    let state = AppState::from_config(&config);
    tracing::info!(
        auth_module = state.authenticator.module_name(),
        transcripts = config.transcripts.enabled,
        "Server state initialized"
    );
    let registry = Arc::clone(&state.registry);
    let app = api::router(state);

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    tracing::info!("Streamgate running on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await
        .context("Server error")?;

    tracing::info!("Streamgate stopped");
    Ok(())
}

/// Resolves on SIGTERM or Ctrl+C after cancelling every active stream, so
/// open response bodies finish and graceful shutdown can complete.
async fn shutdown_signal(registry: Arc<StreamInterruptRegistry>) {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    let cancelled = registry.cancel_all();
    tracing::info!(cancelled, "Shutdown requested");
}
