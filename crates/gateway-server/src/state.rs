//! Application state

use gateway_core::config::GatewayConfig;
use gateway_sandbox::WorkerPool;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub pool: Arc<WorkerPool>,
    /// Shared client for proxying to workers. No global timeout; each
    /// proxied call sets its own deadline.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: GatewayConfig, pool: Arc<WorkerPool>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            config: Arc::new(config),
            pool,
            http,
        }
    }
}
