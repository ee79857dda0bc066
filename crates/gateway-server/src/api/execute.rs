//! The request proxy: /execute

use axum::{extract::State, Json};
use gateway_core::error::GatewayError;
use gateway_core::worker::{
    AgentErrorBody, AgentErrorKind, AgentExecuteRequest, ExecuteRequest, ExecuteResponse,
};
use gateway_sandbox::WorkerPool;
use std::sync::Arc;
use tracing::{error, warn};

use crate::api::ApiError;
use crate::state::AppState;

/// POST /execute
///
/// Forwards the code to the session's worker and applies the recovery
/// policy: the binding survives only a clean reply or a pure user-code
/// error; every other outcome destroys the sandbox.
pub async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let session_id = request.user_uuid;
    let handle = state.pool.acquire(&session_id).await?;

    // If the client disconnects mid-forward this handler future is dropped
    // and nothing below runs; the guard then destroys the sandbox, because
    // there is no way to know whether the interpreter finished.
    let guard = FailureGuard::new(state.pool.clone(), session_id.clone());

    let url = format!("{}/execute", handle.internal_url);
    let response = state
        .http
        .post(&url)
        .json(&AgentExecuteRequest { code: request.code })
        .timeout(state.config.pool.proxy_timeout())
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            let parsed = response.json::<ExecuteResponse>().await;
            guard.disarm();
            match parsed {
                Ok(body) => {
                    state.pool.touch(&session_id).await;
                    Ok(Json(body))
                }
                Err(e) => {
                    error!(
                        session = %session_id,
                        error = %e,
                        "Worker returned an unreadable success body"
                    );
                    state.pool.record_failure(&session_id).await;
                    Err(GatewayError::Internal(
                        "worker returned an invalid response".to_string(),
                    )
                    .into())
                }
            }
        }
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.json::<AgentErrorBody>().await.ok();
            guard.disarm();
            let (destroy, error) = classify_worker_error(status, body);
            if destroy {
                state.pool.record_failure(&session_id).await;
            }
            Err(error.into())
        }
        Err(e) => {
            guard.disarm();
            warn!(session = %session_id, error = %e, "Failed to proxy request to worker");
            state.pool.record_failure(&session_id).await;
            Err(GatewayError::Transport(transport_detail(&e)).into())
        }
    }
}

/// Maps a worker's non-2xx reply to (destroy-the-sandbox, client error).
///
/// Only a 400 explicitly tagged `user_code_error` leaves the sandbox alive;
/// anything ambiguous is treated as contamination.
fn classify_worker_error(status: u16, body: Option<AgentErrorBody>) -> (bool, GatewayError) {
    match body {
        Some(body) if status == 400 && body.kind == AgentErrorKind::UserCodeError => {
            (false, GatewayError::UserCode(body.detail))
        }
        Some(body) if body.kind == AgentErrorKind::UserCodeTimeout => {
            (true, GatewayError::UserCodeTimeout(body.detail))
        }
        Some(body) => (
            true,
            GatewayError::Internal(format!("worker failed: {}", body.detail)),
        ),
        None => (
            true,
            GatewayError::Internal(format!("worker returned status {status}")),
        ),
    }
}

fn transport_detail(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "deadline exceeded while waiting for the worker".to_string()
    } else if error.is_connect() {
        "could not connect to the worker".to_string()
    } else {
        error.to_string()
    }
}

/// Destroys the session's sandbox if dropped while armed.
struct FailureGuard {
    pool: Arc<WorkerPool>,
    session_id: String,
    armed: bool,
}

impl FailureGuard {
    fn new(pool: Arc<WorkerPool>, session_id: String) -> Self {
        Self {
            pool,
            session_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FailureGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(session = %self.session_id, "Execute cancelled mid-flight, destroying worker");
            let pool = self.pool.clone();
            let session_id = std::mem::take(&mut self.session_id);
            tokio::spawn(async move {
                pool.record_failure(&session_id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(kind: AgentErrorKind, detail: &str) -> Option<AgentErrorBody> {
        Some(AgentErrorBody {
            kind,
            detail: detail.to_string(),
        })
    }

    #[test]
    fn user_code_errors_preserve_the_sandbox() {
        let (destroy, error) =
            classify_worker_error(400, body(AgentErrorKind::UserCodeError, "SyntaxError: oops"));
        assert!(!destroy);
        assert!(matches!(error, GatewayError::UserCode(detail) if detail.contains("SyntaxError")));
    }

    #[test]
    fn user_code_timeouts_destroy_the_sandbox() {
        let (destroy, error) =
            classify_worker_error(400, body(AgentErrorKind::UserCodeTimeout, "too slow"));
        assert!(destroy);
        assert!(matches!(error, GatewayError::UserCodeTimeout(_)));
    }

    #[test]
    fn worker_5xx_destroys_the_sandbox() {
        let (destroy, error) =
            classify_worker_error(500, body(AgentErrorKind::KernelError, "kernel died"));
        assert!(destroy);
        assert!(matches!(error, GatewayError::Internal(_)));
    }

    #[test]
    fn untyped_errors_are_treated_as_contamination() {
        let (destroy, error) = classify_worker_error(400, None);
        assert!(destroy);
        assert!(matches!(error, GatewayError::Internal(_)));

        let (destroy, _) = classify_worker_error(502, None);
        assert!(destroy);
    }

    #[test]
    fn a_user_code_kind_on_a_non_400_status_still_destroys() {
        // A worker claiming "user code error" on a 500 is not trustworthy.
        let (destroy, _) =
            classify_worker_error(500, body(AgentErrorKind::UserCodeError, "odd"));
        assert!(destroy);
    }
}
