//! zkxfer-backend
//!
//! HTTP host for the zkxfer protocol engine.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zkxfer_backend::{
    app_router,
    config::{ServiceConfig, DEFAULT_LOG_FILTER},
    AppState,
};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env()?;
    // Built before the runtime starts: the remote oracle owns a blocking HTTP client.
    let state = AppState::from_config(&config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?
        .block_on(serve(config.socket_addr(), state))
}

async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("zkxfer backend listening on {}", addr);

    axum::serve(listener, app_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install CTRL+C signal handler: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
