//! Gateway Sandbox - worker container lifecycle management
//!
//! This crate provides:
//! - A narrow driver port over the Docker engine
//! - Health probing for freshly started workers
//! - The worker pool: session binding, pre-warming and recycling

pub mod docker;
pub mod health;
pub mod pool;

pub use docker::{ContainerDriver, ContainerSpec, DockerDriver, DriverError, DriverResult};
pub use health::{HealthProber, HttpHealthProber};
pub use pool::{PoolStats, WorkerPool};
