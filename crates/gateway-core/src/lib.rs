//! Gateway Core - shared types for the code interpreter gateway
//!
//! This crate provides the foundational types used across the gateway:
//! - Worker and session data model
//! - Wire DTOs for the external API and the gateway-to-worker contract
//! - Error taxonomy
//! - Configuration types

pub mod config;
pub mod error;
pub mod worker;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
