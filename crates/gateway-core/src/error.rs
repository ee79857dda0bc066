//! Gateway error types

use thiserror::Error;

/// Main gateway error type
///
/// Each variant corresponds to one externally observable failure mode; the
/// HTTP layer maps them to status codes without inspecting message strings.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid or missing authentication token")]
    AuthInvalid,

    #[error("Worker pool is initializing. Please try again shortly.")]
    Initializing,

    #[error("No available workers at the moment, please try again later.")]
    NoCapacity,

    #[error("Could not provision a new worker: {0}")]
    CreationFailed(String),

    #[error("{0}")]
    UserCode(String),

    #[error("{0}")]
    UserCodeTimeout(String),

    #[error("Could not reach the execution worker: {0}")]
    Transport(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
