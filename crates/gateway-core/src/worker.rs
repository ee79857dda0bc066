//! Worker and session types for the sandbox pool

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Port the worker agent listens on inside its container.
pub const WORKER_PORT: u16 = 8000;

/// Worker lifecycle state
///
/// `Destroying` is terminal: a worker never transitions out of it and its
/// container id never re-enters the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Creating,
    Idle,
    Busy,
    Destroying,
}

/// Internal state of one worker container, owned exclusively by the pool.
#[derive(Debug, Clone)]
pub struct Worker {
    pub container_id: String,
    pub container_name: String,
    pub internal_url: String,
    pub status: WorkerStatus,
    /// Bound session when `status == Busy`, absent otherwise.
    pub session_id: Option<String>,
    /// Creation time for idle workers, last successful reply for busy ones.
    pub last_active: Instant,
    pub created_at: Instant,
}

impl Worker {
    pub fn new(container_id: String, container_name: String) -> Self {
        let internal_url = format!("http://{}:{}", container_name, WORKER_PORT);
        let now = Instant::now();
        Self {
            container_id,
            container_name,
            internal_url,
            status: WorkerStatus::Creating,
            session_id: None,
            last_active: now,
            created_at: now,
        }
    }

    /// Generates a fresh worker container name.
    pub fn generate_name() -> String {
        format!("code-worker-{}", &Uuid::new_v4().simple().to_string()[..12])
    }

    pub fn bind(&mut self, session_id: &str) {
        self.status = WorkerStatus::Busy;
        self.session_id = Some(session_id.to_string());
        self.last_active = Instant::now();
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            container_id: self.container_id.clone(),
            internal_url: self.internal_url.clone(),
        }
    }
}

/// Cheap snapshot of a worker handed out to request handlers.
///
/// The pool keeps the canonical `Worker`; handlers only need the routing
/// information.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub container_id: String,
    pub internal_url: String,
}

/// POST /execute request body at the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub user_uuid: String,
    pub code: String,
}

/// Execution result returned to the caller.
///
/// At most one of the two fields is populated: an image result nulls the
/// text, an error never reaches this type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default)]
    pub result_text: Option<String>,
    #[serde(default)]
    pub result_base64: Option<String>,
}

/// Request body forwarded to the worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecuteRequest {
    pub code: String,
}

/// POST /release request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub user_uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub status: String,
    pub detail: String,
}

/// GET /status response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers_in_pool: usize,
    pub is_initializing: bool,
}

/// Failure kinds the worker agent reports on non-2xx responses.
///
/// The proxy's preserve-or-destroy decision keys off this field, never off
/// message text: only `UserCodeError` leaves the sandbox alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    UserCodeError,
    UserCodeTimeout,
    KernelError,
}

/// Error body the worker agent attaches to 4xx/5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentErrorBody {
    pub kind: AgentErrorKind,
    pub detail: String,
}
