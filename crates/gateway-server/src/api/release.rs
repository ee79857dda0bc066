//! Session release: /release

use axum::{extract::State, Json};
use gateway_core::worker::{ReleaseRequest, ReleaseResponse};

use crate::state::AppState;

/// POST /release
///
/// Destroys the session's worker. Releasing a session with no worker is a
/// successful no-op.
pub async fn release(
    State(state): State<AppState>,
    Json(request): Json<ReleaseRequest>,
) -> Json<ReleaseResponse> {
    state.pool.release(&request.user_uuid).await;

    Json(ReleaseResponse {
        status: "ok".to_string(),
        detail: format!("session {} released", request.user_uuid),
    })
}
