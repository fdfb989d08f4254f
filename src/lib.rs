pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod provider;
pub mod qr;
pub mod registry;
pub mod session;
pub mod status;

use std::sync::Arc;

use tokio::signal;

use app::{AppState, build_router};
use config::Config;
use events::EventBus;
use observability::OrchestratorMetrics;
use orchestrator::Orchestrator;
use provider::HttpProviderClient;

pub use error::{OrchestratorError, ProviderError, TransportError};
pub use status::{ConnectionState, QrPayload, StatusEvent};

/// Starts the orchestrator HTTP service and runs it until Ctrl-C or SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    observability::init_tracing(config.log_format);

    let bind_addr = config.bind_addr;
    tracing::info!(%bind_addr, provider = %config.provider_url, "starting wa-orchestrator");

    let metrics = OrchestratorMetrics::new();
    let provider = Arc::new(HttpProviderClient::new(
        &config.provider_url,
        &config.provider_api_key,
    )?);
    let bus = match config.bus.clone() {
        Some(bus_config) => EventBus::spawn(bus_config, metrics.clone()),
        None => {
            tracing::info!("provider event stream disabled; sessions rely on polling");
            EventBus::disabled(metrics.clone())
        }
    };

    let orchestrator = Orchestrator::new(provider, bus, config.policy.clone(), metrics);
    let state = AppState::new(orchestrator.clone());
    state.set_ready(true);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, build_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.set_ready(false);
    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                tracing::warn!(error = %error, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
