//! Authentication middleware

use crate::api::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use gateway_core::error::GatewayError;

/// Header carrying the master token.
pub const AUTH_HEADER: &str = "x-auth-token";

/// Rejects requests whose `X-Auth-Token` header does not match the
/// configured master token.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok());

    if presented != Some(state.config.auth_token.as_str()) {
        return ApiError::from(GatewayError::AuthInvalid).into_response();
    }

    next.run(request).await
}
