//! Gateway Server - HTTP API for the code interpreter gateway
//!
//! This crate provides:
//! - The `/execute`, `/release` and `/status` endpoints
//! - Token authentication middleware
//! - The request proxy between callers and worker containers

pub mod api;
pub mod middleware;
pub mod state;

pub use api::create_router;
pub use state::AppState;
