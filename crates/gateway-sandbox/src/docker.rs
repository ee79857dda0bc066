//! Thin driver port over the Docker engine

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use gateway_core::config::WorkerResources;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Label attached to every container the gateway creates.
///
/// External identifier: stale containers from prior runs are enumerated by
/// this label at boot, so it must stay stable across versions.
pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "code-interpreter-gateway";

/// Environment variable carrying the virtual disk device path, read by the
/// worker image entrypoint.
pub const VDISK_DEVICE_ENV: &str = "WORKER_VDISK_DEVICE";

#[derive(Debug, Error)]
pub enum DriverError {
    /// Engine hiccup worth retrying (5xx, connection loss, IO).
    #[error("Container engine transient failure: {0}")]
    Transient(String),

    /// Permanent failure: missing image, quota, name conflict.
    #[error("Container engine failure: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Everything the driver needs to create one worker container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub resources: WorkerResources,
    pub env: Vec<String>,
}

/// Narrow capability over the container engine.
///
/// The pool only ever needs these three operations; keeping the port this
/// small is what makes the pool testable without a running engine.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Creates and starts a container, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> DriverResult<String>;

    /// Force-deletes a container. Deleting a container that no longer
    /// exists is not an error.
    async fn delete(&self, container_id: &str) -> DriverResult<()>;

    /// Lists ids of all containers bearing the management label, running
    /// or not.
    async fn list_managed(&self) -> DriverResult<Vec<String>>;
}

/// Docker implementation of the driver port.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connects to the engine via the default local socket.
    pub fn new() -> DriverResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::Fatal(format!("failed to connect to Docker: {e}")))?;
        Ok(Self { docker })
    }

    fn host_config(resources: &WorkerResources, network: &str) -> HostConfig {
        let memory = (resources.memory_mb * 1024 * 1024) as i64;
        HostConfig {
            network_mode: Some(network.to_string()),
            memory: Some(memory),
            // memory_swap == memory means zero swap (Docker's value is
            // RAM+swap total).
            memory_swap: Some(memory),
            nano_cpus: Some((resources.cpus * 1_000_000_000.0) as i64),
            readonly_rootfs: Some(true),
            storage_opt: Some(HashMap::from([(
                "size".to_string(),
                format!("{}M", resources.disk_mb),
            )])),
            tmpfs: Some(HashMap::from([
                ("/tmp".to_string(), "size=100m,exec".to_string()),
                ("/run".to_string(), "size=50m".to_string()),
            ])),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, spec: &ContainerSpec) -> DriverResult<String> {
        let labels = HashMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())]);

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(labels),
            host_config: Some(Self::host_config(&spec.resources, &spec.network)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };

        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(classify)?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            // The container exists but never started; remove it so the name
            // and capacity slot are reusable.
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(classify(e));
        }

        debug!(container_id = %created.id, name = %spec.name, "Worker container started");
        Ok(created.id)
    }

    async fn delete(&self, container_id: &str) -> DriverResult<()> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Failed to delete container");
                Err(classify(e))
            }
        }
    }

    async fn list_managed(&self) -> DriverResult<Vec<String>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")],
        )]);

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

/// Splits bollard errors into retryable and permanent flavors.
fn classify(error: bollard::errors::Error) -> DriverError {
    match &error {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            if *status_code >= 500 {
                DriverError::Transient(error.to_string())
            } else {
                DriverError::Fatal(error.to_string())
            }
        }
        _ => DriverError::Transient(error.to_string()),
    }
}
