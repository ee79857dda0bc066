//! Worker pool: session binding, pre-warming and recycling
//!
//! One mutex guards the three indexes (registry, session map, idle set).
//! Every registry mutation happens under that lock; every piece of I/O
//! (container create, health probe, delete) happens outside it. A counting
//! semaphore bounds total creations so racing creators cannot overshoot
//! the capacity ceiling.

use crate::docker::{ContainerDriver, ContainerSpec, DriverError, DriverResult, VDISK_DEVICE_ENV};
use crate::health::HealthProber;
use futures::future::join_all;
use gateway_core::config::PoolConfig;
use gateway_core::error::{GatewayError, GatewayResult};
use gateway_core::worker::{Worker, WorkerHandle, WorkerStatus};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// Base delay between creation retries, multiplied by the attempt number.
const CREATION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub is_initializing: bool,
}

#[derive(Default)]
struct PoolState {
    /// container id -> worker
    workers: HashMap<String, Worker>,
    /// session id -> container id
    sessions: HashMap<String, String>,
    /// container ids of idle workers
    idle: HashSet<String>,
    is_initializing: bool,
    is_replenishing: bool,
}

/// Owns the lifecycle of all worker containers.
pub struct WorkerPool {
    config: PoolConfig,
    driver: Arc<dyn ContainerDriver>,
    prober: Arc<dyn HealthProber>,
    state: Mutex<PoolState>,
    creation_permits: Arc<Semaphore>,
    replenish_notify: Notify,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        driver: Arc<dyn ContainerDriver>,
        prober: Arc<dyn HealthProber>,
    ) -> Self {
        let creation_permits = Arc::new(Semaphore::new(config.max_total_workers));
        Self {
            config,
            driver,
            prober,
            state: Mutex::new(PoolState {
                is_initializing: true,
                ..PoolState::default()
            }),
            creation_permits,
            replenish_notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Deletes leftover containers from previous runs, then pre-warms the
    /// idle pool. The pool refuses traffic until this completes.
    pub async fn initialize(&self) {
        info!("Initializing worker pool");
        self.cleanup_stale_workers().await;
        self.replenish().await;

        let mut state = self.state.lock().await;
        state.is_initializing = false;
        info!(idle_workers = state.idle.len(), "Worker pool initialized");
    }

    /// Returns the worker bound to `session_id`, binding an idle one or
    /// creating a fresh one as needed.
    pub async fn acquire(&self, session_id: &str) -> GatewayResult<WorkerHandle> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        self.trigger_replenish();

        {
            let mut state = self.state.lock().await;
            if state.is_initializing {
                return Err(GatewayError::Initializing);
            }

            if let Some(container_id) = state.sessions.get(session_id).cloned() {
                let worker = state
                    .workers
                    .get_mut(&container_id)
                    .ok_or_else(|| bad_index(&container_id))?;
                worker.touch();
                debug!(
                    container = %worker.container_name,
                    session = %session_id,
                    "Reusing existing worker for session"
                );
                return Ok(worker.handle());
            }

            if let Some(container_id) = state.idle.iter().next().cloned() {
                state.idle.remove(&container_id);
                state
                    .sessions
                    .insert(session_id.to_string(), container_id.clone());
                let worker = state
                    .workers
                    .get_mut(&container_id)
                    .ok_or_else(|| bad_index(&container_id))?;
                worker.bind(session_id);
                info!(
                    container = %worker.container_name,
                    session = %session_id,
                    "Assigned idle worker to session"
                );
                return Ok(worker.handle());
            }

            if state.workers.len() >= self.config.max_total_workers {
                return Err(GatewayError::NoCapacity);
            }
        }

        // Pool empty but below capacity: create synchronously for this
        // request, outside the lock.
        info!(session = %session_id, "No idle workers available, creating one");
        let mut worker = self.create_worker().await?;

        let mut state = self.state.lock().await;
        if let Some(existing) = state.sessions.get(session_id).cloned() {
            // A concurrent request bound this session while we were
            // creating; keep the new worker as idle capacity instead of
            // double-binding the session.
            worker.status = WorkerStatus::Idle;
            state.idle.insert(worker.container_id.clone());
            state.workers.insert(worker.container_id.clone(), worker);
            let bound = state
                .workers
                .get_mut(&existing)
                .ok_or_else(|| bad_index(&existing))?;
            return Ok(bound.handle());
        }

        worker.bind(session_id);
        state
            .sessions
            .insert(session_id.to_string(), worker.container_id.clone());
        let handle = worker.handle();
        info!(
            container = %worker.container_name,
            session = %session_id,
            "Assigned newly created worker to session"
        );
        state.workers.insert(worker.container_id.clone(), worker);
        Ok(handle)
    }

    /// Destroys the worker bound to `session_id`, if any. Idempotent.
    pub async fn release(&self, session_id: &str) {
        match self.remove_session(session_id).await {
            Some(worker) => {
                info!(
                    container = %worker.container_name,
                    session = %session_id,
                    "Releasing worker bound to session"
                );
                self.destroy_worker(worker).await;
                self.trigger_replenish();
            }
            None => {
                debug!(session = %session_id, "No worker bound to session during release");
            }
        }
    }

    /// Marks the session's worker as contaminated and destroys it. Same
    /// effect as [`release`](Self::release); kept separate so callers state
    /// their intent and logs tell failures from voluntary releases apart.
    pub async fn record_failure(&self, session_id: &str) {
        match self.remove_session(session_id).await {
            Some(worker) => {
                warn!(
                    container = %worker.container_name,
                    session = %session_id,
                    "Worker considered contaminated, destroying"
                );
                self.destroy_worker(worker).await;
                self.trigger_replenish();
            }
            None => {
                debug!(session = %session_id, "No worker bound to session during failure report");
            }
        }
    }

    /// Refreshes the last-activity timestamp of the session's worker.
    pub async fn touch(&self, session_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(container_id) = state.sessions.get(session_id).cloned() {
            if let Some(worker) = state.workers.get_mut(&container_id) {
                worker.touch();
            }
        }
    }

    /// Weakly consistent pool counters.
    pub async fn snapshot(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            total: state.workers.len(),
            busy: state.sessions.len(),
            idle: state.idle.len(),
            is_initializing: state.is_initializing,
        }
    }

    /// Restores the idle floor. Runs at most one pass at a time; concurrent
    /// triggers while a pass is running coalesce into the queued
    /// notification instead of overlapping.
    pub async fn replenish(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let needed = {
            let mut state = self.state.lock().await;
            if state.is_replenishing {
                return;
            }
            let need = self
                .config
                .min_idle_workers
                .saturating_sub(state.idle.len());
            let room = self
                .config
                .max_total_workers
                .saturating_sub(state.workers.len());
            let needed = need.min(room);
            if needed == 0 {
                return;
            }
            state.is_replenishing = true;
            needed
        };

        info!(count = needed, "Replenishing idle pool");
        let results = join_all((0..needed).map(|_| self.create_worker())).await;

        let mut state = self.state.lock().await;
        let mut added = 0;
        for result in results {
            match result {
                Ok(worker) => {
                    state.idle.insert(worker.container_id.clone());
                    state.workers.insert(worker.container_id.clone(), worker);
                    added += 1;
                }
                Err(e) => {
                    error!(error = %e, "Failed to create worker during replenishment");
                }
            }
        }
        state.is_replenishing = false;

        if added > 0 {
            info!(added, requested = needed, "Added workers to idle pool");
        }
    }

    /// Wakes the replenisher loop without blocking the caller.
    pub fn trigger_replenish(&self) {
        if !self.shutting_down.load(Ordering::SeqCst) {
            self.replenish_notify.notify_one();
        }
    }

    /// Background loop serving [`trigger_replenish`](Self::trigger_replenish)
    /// wake-ups. Spawned once at startup.
    pub async fn run_replenisher(self: Arc<Self>) {
        loop {
            self.replenish_notify.notified().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.replenish().await;
        }
    }

    /// Background loop destroying workers whose session went quiet.
    /// Spawned once at startup.
    pub async fn run_recycler(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.recycling_interval());
        // The first tick completes immediately; skip it so the first scan
        // happens a full period after startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.recycle_timed_out_workers().await;
        }
    }

    /// One recycler pass: unbind and destroy every busy worker whose last
    /// activity is older than the idle timeout.
    pub async fn recycle_timed_out_workers(&self) {
        let timeout = self.config.worker_idle_timeout();

        let victims: Vec<Worker> = {
            let mut state = self.state.lock().await;
            let expired: Vec<(String, String)> = state
                .sessions
                .iter()
                .filter(|(_, container_id)| {
                    state
                        .workers
                        .get(*container_id)
                        .is_some_and(|w| w.is_timed_out(timeout))
                })
                .map(|(session, container_id)| (session.clone(), container_id.clone()))
                .collect();

            expired
                .into_iter()
                .filter_map(|(session, container_id)| {
                    state.sessions.remove(&session);
                    state.idle.remove(&container_id);
                    state.workers.remove(&container_id).map(|mut worker| {
                        worker.status = WorkerStatus::Destroying;
                        warn!(
                            container = %worker.container_name,
                            session = %session,
                            "Worker timed out, recycling"
                        );
                        worker
                    })
                })
                .collect()
        };

        if victims.is_empty() {
            debug!("No timed-out workers found");
            return;
        }

        info!(count = victims.len(), "Destroying timed-out workers");
        join_all(victims.into_iter().map(|w| self.destroy_worker(w))).await;
        self.trigger_replenish();
    }

    /// Destroys every worker. Called from the server's graceful-shutdown
    /// path; the pool refuses new work once this starts.
    pub async fn shutdown(&self) {
        info!("Shutting down worker pool");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.replenish_notify.notify_one();

        let workers: Vec<Worker> = {
            let mut state = self.state.lock().await;
            state.sessions.clear();
            state.idle.clear();
            state
                .workers
                .drain()
                .map(|(_, mut worker)| {
                    worker.status = WorkerStatus::Destroying;
                    worker
                })
                .collect()
        };

        join_all(workers.into_iter().map(|w| self.destroy_worker(w))).await;
        info!("Worker pool shutdown complete");
    }

    async fn remove_session(&self, session_id: &str) -> Option<Worker> {
        let mut state = self.state.lock().await;
        let container_id = state.sessions.remove(session_id)?;
        state.idle.remove(&container_id);
        let mut worker = state.workers.remove(&container_id)?;
        worker.status = WorkerStatus::Destroying;
        Some(worker)
    }

    /// Creates one healthy worker, holding a capacity permit for its whole
    /// lifetime. The permit is forgotten on success (the worker owns it
    /// until [`destroy_worker`](Self::destroy_worker) returns it) and
    /// dropped on failure.
    async fn create_worker(&self) -> GatewayResult<Worker> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }

        // No waiting for a permit: a caller that cannot create right now is
        // told the pool is full instead of queueing behind other creators.
        let permit = match Arc::clone(&self.creation_permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(GatewayError::NoCapacity),
        };

        let mut attempt: u32 = 0;
        loop {
            match self.try_create_worker().await {
                Ok(worker) => {
                    permit.forget();
                    return Ok(worker);
                }
                Err(e) if e.is_retryable() && attempt < self.config.create_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.config.create_retries,
                        error = %e,
                        "Retrying worker creation"
                    );
                    tokio::time::sleep(CREATION_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to create worker");
                    return Err(GatewayError::CreationFailed(e.to_string()));
                }
            }
        }
    }

    async fn try_create_worker(&self) -> DriverResult<Worker> {
        let name = Worker::generate_name();
        info!(container = %name, "Creating worker container");

        let spec = ContainerSpec {
            name: name.clone(),
            image: self.config.worker_image.clone(),
            network: self.config.internal_network.clone(),
            resources: self.config.resources.clone(),
            env: vec![format!("{VDISK_DEVICE_ENV}=/dev/vdisk")],
        };

        let container_id = self.driver.create(&spec).await?;
        let mut worker = Worker::new(container_id, name);

        if !self.prober.probe(&worker.internal_url).await {
            // The container is up but its agent never became healthy; kill
            // it before reporting the failure so it cannot linger.
            let _ = self.driver.delete(&worker.container_id).await;
            return Err(DriverError::Transient(
                "worker failed health check after creation".to_string(),
            ));
        }

        worker.status = WorkerStatus::Idle;
        info!(container = %worker.container_name, "Worker created and healthy");
        Ok(worker)
    }

    async fn destroy_worker(&self, worker: Worker) {
        if let Err(e) = self.driver.delete(&worker.container_id).await {
            error!(
                container = %worker.container_name,
                error = %e,
                "Failed to delete worker container"
            );
        }
        self.creation_permits.add_permits(1);
    }

    async fn cleanup_stale_workers(&self) {
        match self.driver.list_managed().await {
            Ok(stale) if stale.is_empty() => {}
            Ok(stale) => {
                warn!(count = stale.len(), "Found stale worker containers, cleaning up");
                let results = join_all(stale.iter().map(|id| self.driver.delete(id))).await;
                let failed = results.iter().filter(|r| r.is_err()).count();
                info!(
                    succeeded = results.len() - failed,
                    failed, "Stale worker cleanup finished"
                );
            }
            Err(e) => {
                error!(error = %e, "Error during stale worker cleanup");
            }
        }
    }
}

fn bad_index(container_id: &str) -> GatewayError {
    GatewayError::Internal(format!(
        "pool index references unknown container {container_id}"
    ))
}
