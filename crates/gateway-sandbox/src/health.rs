//! Health probing for freshly started workers

use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Decides whether a worker at the given base URL is ready for traffic.
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(&self, base_url: &str) -> bool;
}

#[derive(Debug, Deserialize)]
struct HealthStatus {
    status: String,
}

/// Polls `GET {base_url}/health` until it reports ok or the budget runs out.
///
/// Individual probe failures are expected while the worker boots; only the
/// overall deadline is terminal.
pub struct HttpHealthProber {
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
}

impl HttpHealthProber {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            interval,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProber for HttpHealthProber {
    async fn probe(&self, base_url: &str) -> bool {
        let url = format!("{base_url}/health");
        let deadline = Instant::now() + self.timeout;

        while Instant::now() < deadline {
            let response = self
                .client
                .get(&url)
                .timeout(Self::REQUEST_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    match response.json::<HealthStatus>().await {
                        Ok(health) if health.status == "ok" => {
                            debug!(url = %url, "Worker passed health check");
                            return true;
                        }
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(url = %url, error = %e, "Health probe attempt failed");
                }
            }

            tokio::time::sleep(self.interval).await;
        }

        false
    }
}
