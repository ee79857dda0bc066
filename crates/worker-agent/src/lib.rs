//! Worker Agent - the in-sandbox HTTP service
//!
//! Runs inside each worker container and bridges the gateway's HTTP calls
//! to a persistent Jupyter kernel over one WebSocket stream.

pub mod api;
pub mod kernel;
pub mod reducer;

pub use api::{create_router, AgentState};
pub use kernel::{KernelClient, KernelConfig};
