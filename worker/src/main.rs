//! Binary entry point: load config, build the composition root, bind
//! and serve — the same three-step shape the teacher crate's `main.rs`
//! uses, generalized past its single hardcoded RPC listener.

use std::net::SocketAddr;

use anyhow::Context;
use strixun_core::config::Config;
use strixun_identity_worker::routes;
use strixun_identity_worker::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    let port: u16 = std::env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8787);

    tracing::info!(environment = ?config.environment, port, "starting strixun-identity-worker");

    let state = AppState::build(config);
    let app = routes::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind listener")?;

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
