//! Worker pool lifecycle tests against in-memory engine fakes.

use async_trait::async_trait;
use gateway_core::config::PoolConfig;
use gateway_core::error::GatewayError;
use gateway_sandbox::docker::{ContainerDriver, ContainerSpec, DriverError, DriverResult};
use gateway_sandbox::health::HealthProber;
use gateway_sandbox::pool::WorkerPool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory stand-in for the Docker engine.
#[derive(Default)]
struct FakeDriver {
    /// Live container ids.
    running: Mutex<HashSet<String>>,
    /// Every id ever deleted.
    deleted: Mutex<Vec<String>>,
    /// Monotonic id source; ids are never reused.
    next_id: AtomicUsize,
    /// Fail this many upcoming creates with a transient error.
    transient_failures: AtomicU32,
}

impl FakeDriver {
    fn with_stale(ids: &[&str]) -> Self {
        let driver = Self::default();
        let mut running = driver.running.lock().unwrap();
        for id in ids {
            running.insert(id.to_string());
        }
        drop(running);
        driver
    }

    fn fail_next_creates(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    fn created_count(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn create(&self, spec: &ContainerSpec) -> DriverResult<String> {
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DriverError::Transient("engine hiccup".to_string()));
        }
        let id = format!("fake-{}-{}", self.next_id.fetch_add(1, Ordering::SeqCst), spec.name);
        self.running.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    async fn delete(&self, container_id: &str) -> DriverResult<()> {
        self.running.lock().unwrap().remove(container_id);
        self.deleted.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn list_managed(&self) -> DriverResult<Vec<String>> {
        Ok(self.running.lock().unwrap().iter().cloned().collect())
    }
}

struct InstantProber;

#[async_trait]
impl HealthProber for InstantProber {
    async fn probe(&self, _base_url: &str) -> bool {
        true
    }
}

fn test_config(min_idle: usize, max_total: usize) -> PoolConfig {
    PoolConfig {
        min_idle_workers: min_idle,
        max_total_workers: max_total,
        create_retries: 2,
        ..PoolConfig::default()
    }
}

fn build_pool(config: PoolConfig) -> (Arc<WorkerPool>, Arc<FakeDriver>) {
    let driver = Arc::new(FakeDriver::default());
    let pool = Arc::new(WorkerPool::new(
        config,
        driver.clone(),
        Arc::new(InstantProber),
    ));
    (pool, driver)
}

#[tokio::test]
async fn initialize_prewarms_the_idle_floor() {
    let (pool, driver) = build_pool(test_config(3, 10));
    pool.initialize().await;

    let stats = pool.snapshot().await;
    assert!(!stats.is_initializing);
    assert_eq!(stats.idle, 3);
    assert_eq!(stats.total, 3);
    assert_eq!(stats.busy, 0);
    assert_eq!(driver.running_count(), 3);
}

#[tokio::test]
async fn initialize_deletes_stale_containers_first() {
    let driver = Arc::new(FakeDriver::with_stale(&[
        "old-1", "old-2", "old-3", "old-4", "old-5",
    ]));
    let pool = Arc::new(WorkerPool::new(
        test_config(2, 10),
        driver.clone(),
        Arc::new(InstantProber),
    ));
    pool.initialize().await;

    let deleted = driver.deleted_ids();
    for stale in ["old-1", "old-2", "old-3", "old-4", "old-5"] {
        assert!(deleted.contains(&stale.to_string()), "{stale} not cleaned up");
    }
    assert_eq!(pool.snapshot().await.idle, 2);
}

#[tokio::test]
async fn acquire_before_initialize_is_rejected() {
    let (pool, _driver) = build_pool(test_config(1, 10));
    let err = pool.acquire("u1").await.unwrap_err();
    assert!(matches!(err, GatewayError::Initializing));
}

#[tokio::test]
async fn acquire_is_sticky_per_session() {
    let (pool, _driver) = build_pool(test_config(2, 10));
    pool.initialize().await;

    let first = pool.acquire("u1").await.unwrap();
    let second = pool.acquire("u1").await.unwrap();
    assert_eq!(first.container_id, second.container_id);

    let stats = pool.snapshot().await;
    assert_eq!(stats.busy, 1);
}

#[tokio::test]
async fn distinct_sessions_never_share_a_worker() {
    let (pool, _driver) = build_pool(test_config(4, 10));
    pool.initialize().await;

    let a = pool.acquire("u1").await.unwrap();
    let b = pool.acquire("u2").await.unwrap();
    let c = pool.acquire("u3").await.unwrap();

    let ids: HashSet<_> = [&a, &b, &c].iter().map(|h| h.container_id.clone()).collect();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn pool_full_returns_no_capacity_until_a_release() {
    let (pool, _driver) = build_pool(test_config(0, 2));
    pool.initialize().await;

    pool.acquire("u1").await.unwrap();
    pool.acquire("u2").await.unwrap();

    let err = pool.acquire("u3").await.unwrap_err();
    assert!(matches!(err, GatewayError::NoCapacity));

    pool.release("u1").await;
    pool.acquire("u3").await.unwrap();

    let stats = pool.snapshot().await;
    assert_eq!(stats.busy, 2);
    assert!(stats.total <= 2);
}

#[tokio::test]
async fn release_destroys_the_container_and_unbinds_the_session() {
    let (pool, driver) = build_pool(test_config(1, 10));
    pool.initialize().await;

    let handle = pool.acquire("u1").await.unwrap();
    pool.release("u1").await;

    assert!(driver.deleted_ids().contains(&handle.container_id));
    let stats = pool.snapshot().await;
    assert_eq!(stats.busy, 0);

    // A released container id never reappears.
    let next = pool.acquire("u1").await.unwrap();
    assert_ne!(next.container_id, handle.container_id);
}

#[tokio::test]
async fn record_failure_behaves_like_release() {
    let (pool, driver) = build_pool(test_config(1, 10));
    pool.initialize().await;

    let handle = pool.acquire("u1").await.unwrap();
    pool.record_failure("u1").await;

    assert!(driver.deleted_ids().contains(&handle.container_id));
    assert_eq!(pool.snapshot().await.busy, 0);

    let next = pool.acquire("u1").await.unwrap();
    assert_ne!(next.container_id, handle.container_id);
}

#[tokio::test]
async fn releasing_an_unknown_session_is_a_noop() {
    let (pool, driver) = build_pool(test_config(1, 10));
    pool.initialize().await;

    let before = driver.deleted_ids().len();
    pool.release("nobody").await;
    pool.release("nobody").await;
    assert_eq!(driver.deleted_ids().len(), before);
}

#[tokio::test(start_paused = true)]
async fn transient_create_failures_are_retried() {
    let (pool, driver) = build_pool(test_config(0, 10));
    pool.initialize().await;

    driver.fail_next_creates(2);
    let handle = pool.acquire("u1").await.unwrap();
    assert!(driver.running_count() >= 1);
    assert!(!handle.container_id.is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_as_creation_failed() {
    let (pool, driver) = build_pool(test_config(0, 10));
    pool.initialize().await;

    // create_retries = 2, so three consecutive failures exhaust the budget.
    driver.fail_next_creates(3);
    let err = pool.acquire("u1").await.unwrap_err();
    assert!(matches!(err, GatewayError::CreationFailed(_)));
    assert_eq!(pool.snapshot().await.total, 0);
}

#[tokio::test]
async fn replenish_respects_the_capacity_ceiling() {
    let (pool, _driver) = build_pool(test_config(5, 3));
    pool.initialize().await;

    let stats = pool.snapshot().await;
    assert_eq!(stats.idle, 3);
    assert_eq!(stats.total, 3);
}

#[tokio::test]
async fn replenish_restores_the_idle_floor_after_a_release() {
    let (pool, _driver) = build_pool(test_config(2, 10));
    pool.initialize().await;

    pool.acquire("u1").await.unwrap();
    pool.release("u1").await;
    pool.replenish().await;

    let stats = pool.snapshot().await;
    assert!(stats.idle >= 2, "idle floor not restored: {}", stats.idle);
    assert_eq!(stats.busy, 0);
}

#[tokio::test]
async fn recycler_destroys_only_timed_out_sessions() {
    let mut config = test_config(0, 10);
    config.worker_idle_timeout_secs = 0;
    let (pool, driver) = build_pool(config);
    pool.initialize().await;

    let handle = pool.acquire("u1").await.unwrap();
    // Zero timeout: the binding is expired as soon as the recycler looks.
    pool.recycle_timed_out_workers().await;

    assert!(driver.deleted_ids().contains(&handle.container_id));
    let stats = pool.snapshot().await;
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.total, 0);

    let next = pool.acquire("u1").await.unwrap();
    assert_ne!(next.container_id, handle.container_id);
}

#[tokio::test]
async fn recycler_keeps_active_sessions() {
    let mut config = test_config(0, 10);
    config.worker_idle_timeout_secs = 3600;
    let (pool, driver) = build_pool(config);
    pool.initialize().await;

    let handle = pool.acquire("u1").await.unwrap();
    pool.recycle_timed_out_workers().await;

    assert!(!driver.deleted_ids().contains(&handle.container_id));
    assert_eq!(pool.snapshot().await.busy, 1);
}

#[tokio::test]
async fn idle_workers_are_not_recycled() {
    let mut config = test_config(2, 10);
    config.worker_idle_timeout_secs = 0;
    let (pool, _driver) = build_pool(config);
    pool.initialize().await;

    pool.recycle_timed_out_workers().await;
    // Only busy workers are subject to the idle timeout.
    assert_eq!(pool.snapshot().await.idle, 2);
}

#[tokio::test]
async fn concurrent_acquires_for_one_session_bind_exactly_one_worker() {
    let (pool, _driver) = build_pool(test_config(0, 10));
    pool.initialize().await;

    let handles = futures::future::join_all((0..8).map(|_| {
        let pool = pool.clone();
        async move { pool.acquire("u1").await.unwrap() }
    }))
    .await;

    let ids: HashSet<_> = handles.iter().map(|h| h.container_id.clone()).collect();
    assert_eq!(ids.len(), 1, "session bound to multiple workers");
    assert_eq!(pool.snapshot().await.busy, 1);
}

#[tokio::test]
async fn concurrent_acquires_never_exceed_capacity() {
    let (pool, driver) = build_pool(test_config(0, 4));
    pool.initialize().await;

    let results = futures::future::join_all((0..12).map(|i| {
        let pool = pool.clone();
        async move { pool.acquire(&format!("u{i}")).await }
    }))
    .await;

    let granted: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert!(granted.len() <= 4);
    assert!(driver.running_count() <= 4);
    assert!(pool.snapshot().await.total <= 4);
}

#[tokio::test]
async fn shutdown_destroys_everything_and_refuses_new_work() {
    let (pool, driver) = build_pool(test_config(2, 10));
    pool.initialize().await;
    pool.acquire("u1").await.unwrap();

    pool.shutdown().await;

    assert_eq!(driver.running_count(), 0);
    let stats = pool.snapshot().await;
    assert_eq!(stats.total, 0);

    let err = pool.acquire("u2").await.unwrap_err();
    assert!(matches!(err, GatewayError::ShuttingDown));
}
