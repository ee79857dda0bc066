//! Gateway configuration types

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    /// Master token required on every request. Resolved at startup, never
    /// read from this struct's serialized form.
    #[serde(skip)]
    pub auth_token: String,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Target number of idle workers kept warm.
    #[serde(default = "default_min_idle")]
    pub min_idle_workers: usize,
    /// Absolute ceiling on concurrent workers.
    #[serde(default = "default_max_total")]
    pub max_total_workers: usize,
    /// Seconds a busy worker may sit inactive before being recycled.
    #[serde(default = "default_idle_timeout")]
    pub worker_idle_timeout_secs: u64,
    /// Period of the background recycler.
    #[serde(default = "default_recycling_interval")]
    pub recycling_interval_secs: u64,
    /// Hard per-request execution budget enforced inside the worker.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    /// End-to-end deadline for one proxied execute call. Must exceed
    /// `execution_timeout_secs` so user-code timeouts are reported by the
    /// worker before the proxy deadline fires.
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    /// Total budget for one worker health probe.
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// Delay between health probe attempts.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
    /// Attempts per worker creation on transient engine failures.
    #[serde(default = "default_create_retries")]
    pub create_retries: u32,
    #[serde(default = "default_worker_image")]
    pub worker_image: String,
    #[serde(default = "default_internal_network")]
    pub internal_network: String,
    #[serde(default)]
    pub resources: WorkerResources,
}

/// Per-worker resource caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResources {
    #[serde(default = "default_worker_cpus")]
    pub cpus: f64,
    #[serde(default = "default_worker_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_worker_disk_mb")]
    pub disk_mb: u64,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            cpus: default_worker_cpus(),
            memory_mb: default_worker_memory_mb(),
            disk_mb: default_worker_disk_mb(),
        }
    }
}

fn default_min_idle() -> usize {
    5
}

fn default_max_total() -> usize {
    30
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_recycling_interval() -> u64 {
    300
}

fn default_execution_timeout() -> u64 {
    10
}

fn default_proxy_timeout() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    30
}

fn default_probe_interval() -> u64 {
    500
}

fn default_create_retries() -> u32 {
    3
}

fn default_worker_image() -> String {
    "code-interpreter-worker:latest".to_string()
}

fn default_internal_network() -> String {
    "code-interpreter_workers_isolated_net".to_string()
}

fn default_worker_cpus() -> f64 {
    1.5
}

fn default_worker_memory_mb() -> u64 {
    1536
}

fn default_worker_disk_mb() -> u64 {
    500
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle_workers: default_min_idle(),
            max_total_workers: default_max_total(),
            worker_idle_timeout_secs: default_idle_timeout(),
            recycling_interval_secs: default_recycling_interval(),
            execution_timeout_secs: default_execution_timeout(),
            proxy_timeout_secs: default_proxy_timeout(),
            health_timeout_secs: default_health_timeout(),
            probe_interval_ms: default_probe_interval(),
            create_retries: default_create_retries(),
            worker_image: default_worker_image(),
            internal_network: default_internal_network(),
            resources: WorkerResources::default(),
        }
    }
}

impl PoolConfig {
    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_secs)
    }

    pub fn recycling_interval(&self) -> Duration {
        Duration::from_secs(self.recycling_interval_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl GatewayConfig {
    /// Assembles the configuration from environment variables, falling back
    /// to the defaults above.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("GATEWAY_HOST", default_host()),
                port: env_parse("GATEWAY_PORT", default_port()),
            },
            pool: PoolConfig {
                min_idle_workers: env_parse("MIN_IDLE_WORKERS", default_min_idle()),
                max_total_workers: env_parse("MAX_TOTAL_WORKERS", default_max_total()),
                worker_idle_timeout_secs: env_parse("WORKER_IDLE_TIMEOUT", default_idle_timeout()),
                recycling_interval_secs: env_parse(
                    "RECYCLING_INTERVAL",
                    default_recycling_interval(),
                ),
                execution_timeout_secs: env_parse(
                    "EXECUTION_TIMEOUT",
                    default_execution_timeout(),
                ),
                proxy_timeout_secs: env_parse("PROXY_TIMEOUT", default_proxy_timeout()),
                health_timeout_secs: env_parse("HEALTH_TIMEOUT", default_health_timeout()),
                probe_interval_ms: env_parse("PROBE_INTERVAL_MS", default_probe_interval()),
                create_retries: env_parse("WORKER_CREATE_RETRIES", default_create_retries()),
                worker_image: env_or("WORKER_IMAGE", default_worker_image()),
                internal_network: env_or("INTERNAL_NETWORK_NAME", default_internal_network()),
                resources: WorkerResources {
                    cpus: env_parse("WORKER_CPUS", default_worker_cpus()),
                    memory_mb: env_parse("WORKER_RAM_MB", default_worker_memory_mb()),
                    disk_mb: env_parse("WORKER_MAX_DISK_SIZE_MB", default_worker_disk_mb()),
                },
            },
            auth_token: String::new(),
        }
    }

    /// Rejects configurations whose timeouts would race.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool.proxy_timeout_secs <= self.pool.execution_timeout_secs {
            return Err(format!(
                "PROXY_TIMEOUT ({}s) must exceed EXECUTION_TIMEOUT ({}s)",
                self.pool.proxy_timeout_secs, self.pool.execution_timeout_secs
            ));
        }
        if self.pool.min_idle_workers > self.pool.max_total_workers {
            return Err(format!(
                "MIN_IDLE_WORKERS ({}) must not exceed MAX_TOTAL_WORKERS ({})",
                self.pool.min_idle_workers, self.pool.max_total_workers
            ));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default,
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Resolves the master auth token.
///
/// Precedence: `AUTH_TOKEN` env var, then the persisted token file, then a
/// freshly generated token. The resolved token is always written back to the
/// file (owner-only permissions) so start scripts can read it; the file is
/// the only state the gateway persists across restarts.
pub fn resolve_auth_token(token_file: &Path) -> io::Result<String> {
    if let Ok(token) = std::env::var("AUTH_TOKEN") {
        if !token.is_empty() {
            persist_token(token_file, &token)?;
            return Ok(token);
        }
    }

    if token_file.exists() {
        let token = std::fs::read_to_string(token_file)?;
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let token = Uuid::new_v4().to_string();
    persist_token(token_file, &token)?;
    Ok(token)
}

fn persist_token(token_file: &Path, token: &str) -> io::Result<()> {
    if let Some(parent) = token_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(token_file, token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(token_file, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
