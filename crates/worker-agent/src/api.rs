//! Agent HTTP surface: /health, /execute, /reset

use crate::kernel::KernelClient;
use crate::reducer::ExecutionOutcome;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gateway_core::worker::{AgentErrorBody, AgentErrorKind, AgentExecuteRequest, ExecuteResponse};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Clone)]
pub struct AgentState {
    pub kernel: Arc<KernelClient>,
    pub execution_timeout: Duration,
}

pub fn create_router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute))
        .route("/reset", post(reset))
        .with_state(state)
}

/// GET /health
async fn health(State(state): State<AgentState>) -> Response {
    if state.kernel.is_healthy().await {
        Json(json!({ "status": "ok" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy" })),
        )
            .into_response()
    }
}

/// POST /execute
async fn execute(
    State(state): State<AgentState>,
    Json(request): Json<AgentExecuteRequest>,
) -> Response {
    let outcome = state.kernel.execute(&request.code).await;
    match outcome_to_reply(outcome, state.execution_timeout) {
        Ok(body) => Json(body).into_response(),
        Err((status, body)) => {
            warn!(kind = ?body.kind, detail = %body.detail, "Execution did not succeed");
            (status, Json(body)).into_response()
        }
    }
}

/// POST /reset
async fn reset(State(state): State<AgentState>) -> Response {
    if state.kernel.reset().await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "Failed to reset the kernel" })),
        )
            .into_response()
    }
}

/// Maps an execution outcome to the wire contract.
///
/// User-code failures are the caller's fault (400); a dead kernel or lost
/// channel means this whole worker is done for (500). A timeout is
/// reported as a 400 of its own kind: the gateway destroys the worker,
/// the caller learns their code ran too long.
fn outcome_to_reply(
    outcome: ExecutionOutcome,
    timeout: Duration,
) -> Result<ExecuteResponse, (StatusCode, AgentErrorBody)> {
    match outcome {
        ExecutionOutcome::Text(text) => Ok(ExecuteResponse {
            result_text: Some(text),
            result_base64: None,
        }),
        ExecutionOutcome::Image(image) => Ok(ExecuteResponse {
            result_text: None,
            result_base64: Some(image),
        }),
        ExecutionOutcome::UserError(detail) => Err((
            StatusCode::BAD_REQUEST,
            AgentErrorBody {
                kind: AgentErrorKind::UserCodeError,
                detail: format!("Python execution error: {detail}"),
            },
        )),
        ExecutionOutcome::TimedOut => Err((
            StatusCode::BAD_REQUEST,
            AgentErrorBody {
                kind: AgentErrorKind::UserCodeTimeout,
                detail: format!(
                    "Code execution timed out after {} seconds",
                    timeout.as_secs()
                ),
            },
        )),
        ExecutionOutcome::KernelDead | ExecutionOutcome::ConnectionLost => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            AgentErrorBody {
                kind: AgentErrorKind::KernelError,
                detail: "Execution environment lost; this worker must be replaced".to_string(),
            },
        )),
    }
}
