//! Code Interpreter Gateway
//!
//! Multi-tenant code execution behind a single HTTP API: each session gets
//! its own sandboxed worker container, pre-warmed and recycled by the
//! worker pool.

use anyhow::Result;
use gateway_core::config::{resolve_auth_token, GatewayConfig};
use gateway_sandbox::{DockerDriver, HttpHealthProber, WorkerPool};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Code Interpreter Gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = GatewayConfig::from_env();
    let token_file = std::env::var("AUTH_TOKEN_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/gateway/auth_token.txt"));
    config.auth_token = resolve_auth_token(&token_file)?;
    config.validate().map_err(anyhow::Error::msg)?;
    info!(token_file = %token_file.display(), "Auth token resolved");

    let driver = Arc::new(DockerDriver::new()?);
    let prober = Arc::new(HttpHealthProber::new(
        config.pool.probe_interval(),
        config.pool.health_timeout(),
    ));
    let pool = Arc::new(WorkerPool::new(config.pool.clone(), driver, prober));

    // Stale cleanup and pre-warm happen before the listener opens; requests
    // arriving during this window would only see 503 Initializing anyway.
    pool.initialize().await;

    let replenisher = tokio::spawn(pool.clone().run_replenisher());
    let recycler = tokio::spawn(pool.clone().run_recycler());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = gateway_server::AppState::new(config, pool.clone());

    let app = gateway_server::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, cleaning up all worker containers");
    recycler.abort();
    replenisher.abort();
    pool.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown signal handler");
    }
}
