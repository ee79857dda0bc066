//! Worker agent entrypoint
//!
//! Runs inside the worker container. Not exposed publicly; the gateway is
//! the only caller and handles authentication.

use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use worker_agent::{create_router, AgentState, KernelClient, KernelConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Worker agent starting");

    let config = KernelConfig::from_env();
    let execution_timeout = config.execution_timeout;
    let port: u16 = std::env::var("AGENT_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);

    let kernel = Arc::new(KernelClient::new(config));
    kernel.start().await?;

    let app = create_router(AgentState {
        kernel,
        execution_timeout,
    });

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Worker agent listening");
    axum::serve(listener, app).await?;

    Ok(())
}
