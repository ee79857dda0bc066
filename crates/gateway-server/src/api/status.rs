//! Pool status: /status

use axum::{extract::State, Json};
use gateway_core::worker::PoolStatus;

use crate::state::AppState;

/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<PoolStatus> {
    let stats = state.pool.snapshot().await;

    Json(PoolStatus {
        total_workers: stats.total,
        busy_workers: stats.busy,
        idle_workers_in_pool: stats.idle,
        is_initializing: stats.is_initializing,
    })
}
