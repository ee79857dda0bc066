//! API routes

pub mod execute;
pub mod release;
pub mod status;

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gateway_core::error::GatewayError;
use serde_json::json;

use crate::middleware::{auth, logging};
use crate::state::AppState;

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(execute::execute))
        .route("/release", post(release::release))
        .route("/status", get(status::status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(logging::log_requests))
        .with_state(state)
}

/// API error response, carrying a typed gateway error.
///
/// The HTTP mapping lives here and nowhere else: handlers return
/// `GatewayError` kinds and never pick status codes themselves.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::AuthInvalid => StatusCode::UNAUTHORIZED,
            GatewayError::UserCode(_) | GatewayError::UserCodeTimeout(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Initializing
            | GatewayError::NoCapacity
            | GatewayError::CreationFailed(_)
            | GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Transport(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_the_documented_status_codes() {
        let cases = [
            (GatewayError::AuthInvalid, StatusCode::UNAUTHORIZED),
            (GatewayError::Initializing, StatusCode::SERVICE_UNAVAILABLE),
            (GatewayError::NoCapacity, StatusCode::SERVICE_UNAVAILABLE),
            (
                GatewayError::CreationFailed("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::UserCode("SyntaxError".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::UserCodeTimeout("slow".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::Transport("refused".into()),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                GatewayError::Internal("bug".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
