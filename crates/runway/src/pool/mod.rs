//! Worker Pool
//!
//! Owns every live [`WorkerInstance`], keyed by [`WorkerKey`]. Instances are
//! created lazily, reused while warm and retired on idle timeout, TTL,
//! request count, memory pressure, capacity or explicit eviction.
//!
//! # Retirement
//!
//! A retired instance is removed from the map at once, so the next request
//! creates a fresh worker. The old one drains its in-flight requests in the
//! background before it is shut down. Forced retirement (shutdown, memory
//! pressure) shuts down immediately and in-flight requests fail with the
//! retryable `Terminated` error.

mod factory;
mod instance;
mod memory;
mod metrics;

pub use factory::{ThreadWorkerFactory, WorkerFactory};
pub use instance::{AppWorker, WorkerInstance};
pub use memory::{FixedMemory, MemoryProbe, SystemMemory};
pub use metrics::{PoolMetrics, WorkerSnapshot};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use runway_worker::{WorkerError, WorkerRequest, WorkerResponse};
use serde::Serialize;
use tokio::sync::{watch, OnceCell};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{PoolSettings, WorkerConfig, WorkerKey};
use crate::error::{Error, Result};
use metrics::Counters;

/// Extra time granted to a draining worker beyond its request timeout.
const DRAIN_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EvictionReason {
    Idle,
    Ttl,
    MaxRequests,
    MemoryPressure,
    Capacity,
    Manual,
    Shutdown,
}

impl EvictionReason {
    fn forced(self) -> bool {
        matches!(self, EvictionReason::MemoryPressure | EvictionReason::Shutdown)
    }
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvictionReason::Idle => "idle",
            EvictionReason::Ttl => "ttl",
            EvictionReason::MaxRequests => "max-requests",
            EvictionReason::MemoryPressure => "memory-pressure",
            EvictionReason::Capacity => "capacity",
            EvictionReason::Manual => "manual",
            EvictionReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Payload of worker spawn/terminate notifications.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEvent {
    pub worker_id: u64,
    pub dir: PathBuf,
    pub reason: Option<EvictionReason>,
}

/// Observer of worker lifecycle events. Implementations must not fail.
#[async_trait]
pub trait WorkerLifecycle: Send + Sync {
    async fn worker_spawned(&self, event: &WorkerEvent);
    async fn worker_terminated(&self, event: &WorkerEvent);
}

/// Lifecycle observer that ignores everything.
pub struct NoopLifecycle;

#[async_trait]
impl WorkerLifecycle for NoopLifecycle {
    async fn worker_spawned(&self, _event: &WorkerEvent) {}
    async fn worker_terminated(&self, _event: &WorkerEvent) {}
}

/// Map entry for one key. `waiters` counts callers currently inside
/// `instance_for` for this slot; a slot whose creation failed is only
/// dropped from the map once nobody is waiting on it.
#[derive(Default)]
struct Slot {
    cell: OnceCell<Arc<WorkerInstance>>,
    waiters: AtomicUsize,
}

/// Registration of one caller on a slot, released on drop.
struct Waiting(Arc<Slot>);

impl Drop for Waiting {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    slots: DashMap<WorkerKey, Arc<Slot>>,
    factory: Arc<dyn WorkerFactory>,
    lifecycle: Arc<dyn WorkerLifecycle>,
    memory: Arc<dyn MemoryProbe>,
    settings: PoolSettings,
    counters: Counters,
    closed: AtomicBool,
    drains: Mutex<JoinSet<()>>,
    capacity: Mutex<()>,
}

impl WorkerPool {
    pub fn new(
        settings: PoolSettings,
        factory: Arc<dyn WorkerFactory>,
        lifecycle: Arc<dyn WorkerLifecycle>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            factory,
            lifecycle,
            memory: Arc::new(SystemMemory::new()),
            settings,
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            drains: Mutex::new(JoinSet::new()),
            capacity: Mutex::new(()),
        }
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    /// Cached instance for `(dir, config)`, created on first access.
    ///
    /// Concurrent callers for the same key share a single creation.
    pub async fn get_or_create(
        &self,
        dir: &Path,
        config: Arc<WorkerConfig>,
    ) -> Result<Arc<WorkerInstance>> {
        let key = WorkerKey::new(dir, &config)?;
        self.instance_for(&key, &config).await
    }

    async fn instance_for(
        &self,
        key: &WorkerKey,
        config: &Arc<WorkerConfig>,
    ) -> Result<Arc<WorkerInstance>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Worker(WorkerError::Terminated));
            }

            // Registered under the shard lock so a failing creator cannot
            // drop the slot out from under us.
            let waiting = {
                let entry = self.slots.entry(key.clone()).or_default();
                entry.waiters.fetch_add(1, Ordering::SeqCst);
                Waiting(Arc::clone(&entry))
            };
            let slot = waiting.0.clone();

            let created = AtomicBool::new(false);
            let result = slot
                .cell
                .get_or_try_init(|| async {
                    created.store(true, Ordering::SeqCst);
                    self.create(key, config).await
                })
                .await;

            let instance = match result {
                Ok(instance) => instance.clone(),
                Err(e) => {
                    drop(waiting);
                    self.slots.remove_if(key, |_, current| {
                        Arc::ptr_eq(current, &slot)
                            && current.cell.get().is_none()
                            && current.waiters.load(Ordering::SeqCst) == 0
                    });
                    return Err(e);
                }
            };

            // Shutdown started while we were creating or waiting.
            if self.closed.load(Ordering::SeqCst) {
                self.retire(&instance, EvictionReason::Shutdown);
                return Err(Error::Worker(WorkerError::Terminated));
            }

            if created.load(Ordering::SeqCst) {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.enforce_capacity(&instance);
                if instance.is_retired() {
                    continue;
                }
                return Ok(instance);
            }

            if instance.is_retired() {
                continue;
            }
            if let Some(reason) = instance.expiry(Instant::now()) {
                self.retire(&instance, reason);
                continue;
            }

            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(instance);
        }
    }

    async fn create(&self, key: &WorkerKey, config: &Arc<WorkerConfig>) -> Result<Arc<WorkerInstance>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Worker(WorkerError::Terminated));
        }
        self.make_room();

        let worker = match self.factory.create(&key.dir, config).await {
            Ok(worker) => worker,
            Err(source) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to create worker for {}: {}", key.dir.display(), source);
                return Err(Error::WorkerCreation {
                    dir: key.dir.clone(),
                    source,
                });
            }
        };

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        let instance = Arc::new(WorkerInstance::new(key.clone(), config.clone(), worker));
        info!(worker_id = instance.id(), "Worker created for {}", key.dir.display());

        self.lifecycle
            .worker_spawned(&WorkerEvent {
                worker_id: instance.id(),
                dir: key.dir.clone(),
                reason: None,
            })
            .await;

        Ok(instance)
    }

    /// Route one request to the worker for `(dir, config)`.
    ///
    /// The request that reaches `maxRequests` is still served; the instance
    /// is retired right away so the next request gets a new worker.
    pub async fn fetch(
        &self,
        dir: &Path,
        config: Arc<WorkerConfig>,
        request: WorkerRequest,
    ) -> Result<WorkerResponse> {
        let key = WorkerKey::new(dir, &config)?;

        loop {
            let instance = self.instance_for(&key, &config).await?;
            // Retired between lookup and use; look again.
            let Some(guard) = instance.begin() else {
                continue;
            };

            if guard.count >= config.max_requests {
                self.retire(&instance, EvictionReason::MaxRequests);
            }

            let started = Instant::now();
            let result = instance.worker().fetch(request).await;
            self.counters.record_request(started.elapsed());
            drop(guard);

            return result.map_err(Error::from);
        }
    }

    /// Retire `instance` unless it already is. Returns true when this call
    /// retired it.
    pub fn retire(&self, instance: &Arc<WorkerInstance>, reason: EvictionReason) -> bool {
        if !instance.retire() {
            return false;
        }

        self.slots.remove_if(instance.key(), |_, slot| {
            slot.cell
                .get()
                .is_some_and(|current| Arc::ptr_eq(current, instance))
        });
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(
            worker_id = instance.id(),
            %reason,
            "Retiring worker for {}",
            instance.key().dir.display()
        );

        let limit = if reason.forced() {
            Duration::ZERO
        } else {
            instance.config().timeout() + DRAIN_SLACK
        };
        let instance = instance.clone();
        let lifecycle = self.lifecycle.clone();
        self.drains
            .lock()
            .spawn(async move { terminate(instance, lifecycle, reason, limit).await });
        true
    }

    /// Evict every expired instance and apply memory pressure. Returns the
    /// number of instances retired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;

        for instance in self.instances() {
            if let Some(reason) = instance.expiry(now) {
                if self.retire(&instance, reason) {
                    evicted += 1;
                }
            }
        }

        if self.under_memory_pressure() {
            let victim = self
                .instances()
                .into_iter()
                .filter(|i| i.config().low_memory)
                .min_by_key(|i| i.last_used());
            if let Some(victim) = victim {
                warn!(
                    worker_id = victim.id(),
                    "Memory pressure, evicting {}",
                    victim.key().dir.display()
                );
                if self.retire(&victim, EvictionReason::MemoryPressure) {
                    evicted += 1;
                }
            }
        }

        let mut drains = self.drains.lock();
        while drains.try_join_next().is_some() {}

        evicted
    }

    fn under_memory_pressure(&self) -> bool {
        match self.memory.available_fraction() {
            Some(available) => available < self.settings.memory_pressure_threshold,
            None => false,
        }
    }

    /// Retire the least recently used instance when the pool is full,
    /// preferring idle ones.
    fn make_room(&self) {
        if self.settings.max_size == 0 {
            return;
        }
        let instances = self.instances();
        if instances.len() < self.settings.max_size {
            return;
        }

        let victim = instances
            .iter()
            .filter(|i| i.in_flight() == 0)
            .min_by_key(|i| i.last_used())
            .or_else(|| instances.iter().min_by_key(|i| i.last_used()));
        if let Some(victim) = victim {
            self.retire(victim, EvictionReason::Capacity);
        }
    }

    /// Bring the pool back to `max_size` after `fresh` joined it. Creations
    /// for different keys run concurrently, so the check before creating
    /// can be outrun; this one is serialized.
    fn enforce_capacity(&self, fresh: &Arc<WorkerInstance>) {
        if self.settings.max_size == 0 {
            return;
        }
        let _guard = self.capacity.lock();
        if fresh.is_retired() {
            return;
        }

        let mut others: Vec<_> = self
            .instances()
            .into_iter()
            .filter(|i| !Arc::ptr_eq(i, fresh))
            .collect();
        while others.len() >= self.settings.max_size {
            let idle = others
                .iter()
                .enumerate()
                .filter(|(_, i)| i.in_flight() == 0)
                .min_by_key(|(_, i)| i.last_used())
                .map(|(n, _)| n);
            let oldest = others
                .iter()
                .enumerate()
                .min_by_key(|(_, i)| i.last_used())
                .map(|(n, _)| n);
            let Some(n) = idle.or(oldest) else {
                break;
            };
            let victim = others.swap_remove(n);
            self.retire(&victim, EvictionReason::Capacity);
        }
    }

    /// Retire every instance, letting in-flight requests finish.
    pub fn evict_all(&self) -> usize {
        self.instances()
            .iter()
            .filter(|instance| self.retire(instance, EvictionReason::Manual))
            .count()
    }

    /// Stop accepting work and shut down every instance.
    ///
    /// In-flight requests get up to `shutdown_grace_ms` to finish before
    /// their workers are terminated.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let grace = Duration::from_millis(self.settings.shutdown_grace_ms);
        let instances = self.instances();
        info!("Shutting down {} workers", instances.len());

        let mut set = JoinSet::new();
        for instance in instances {
            if !instance.retire() {
                continue;
            }
            self.slots.remove(instance.key());
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            let lifecycle = self.lifecycle.clone();
            set.spawn(async move {
                terminate(instance, lifecycle, EvictionReason::Shutdown, grace).await
            });
        }

        while set.join_next().await.is_some() {}

        // Creations already under way retire themselves once they see the
        // pool closed; wait for them so their workers are drained below.
        let settled = async {
            while self.has_waiters() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(grace.max(DRAIN_SLACK), settled).await.is_err() {
            warn!("Worker creations still pending at shutdown");
        }

        let mut pending = std::mem::take(&mut *self.drains.lock());
        while pending.join_next().await.is_some() {}
        self.slots.clear();
    }

    fn has_waiters(&self) -> bool {
        self.slots
            .iter()
            .any(|entry| entry.waiters.load(Ordering::SeqCst) > 0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Live (initialized, not retired) instances.
    pub fn instances(&self) -> Vec<Arc<WorkerInstance>> {
        self.slots
            .iter()
            .filter_map(|entry| entry.value().cell.get().cloned())
            .filter(|instance| !instance.is_retired())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> PoolMetrics {
        let now = Instant::now();
        let instances = self.instances();
        let workers = instances.iter().map(|i| i.snapshot(now)).collect();
        self.counters.snapshot(instances.len(), workers)
    }

    /// Run [`WorkerPool::sweep`] on the configured interval until stopped.
    pub fn start_sweeper(self: &Arc<Self>) -> SweepHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let pool = Arc::clone(self);
        let period = Duration::from_millis(self.settings.sweep_interval_ms.max(1));

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {
                        let evicted = pool.sweep();
                        if evicted > 0 {
                            debug!("Sweep evicted {} workers", evicted);
                        }
                    }
                }
            }
            debug!("Pool sweeper stopped");
        });

        SweepHandle {
            stop: stop_tx,
            task,
        }
    }
}

/// Running sweep task.
pub struct SweepHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("Pool sweeper failed: {}", e);
        }
    }
}

async fn terminate(
    instance: Arc<WorkerInstance>,
    lifecycle: Arc<dyn WorkerLifecycle>,
    reason: EvictionReason,
    limit: Duration,
) {
    if !limit.is_zero() && !instance.drain(limit).await {
        warn!(
            worker_id = instance.id(),
            "Worker still busy after {:?}, terminating",
            limit
        );
    }

    instance.worker().shutdown().await;
    info!(
        worker_id = instance.id(),
        %reason,
        "Worker terminated for {}",
        instance.key().dir.display()
    );

    lifecycle
        .worker_terminated(&WorkerEvent {
            worker_id: instance.id(),
            dir: instance.key().dir.clone(),
            reason: Some(reason),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    use bytes::Bytes;
    use futures::future::join_all;

    struct FakeWorker {
        id: u64,
        delay: Duration,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl AppWorker for FakeWorker {
        fn id(&self) -> u64 {
            self.id
        }

        async fn fetch(&self, _request: WorkerRequest) -> std::result::Result<WorkerResponse, WorkerError> {
            tokio::time::sleep(self.delay).await;
            if self.stopped.load(Ordering::SeqCst) {
                return Err(WorkerError::Terminated);
            }
            Ok(http::Response::new(Bytes::from(self.id.to_string())))
        }

        async fn shutdown(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        attempts: AtomicU64,
        create_delay: Duration,
        fetch_delay: Duration,
        fail: bool,
        fail_first: bool,
    }

    #[async_trait]
    impl WorkerFactory for FakeFactory {
        async fn create(
            &self,
            _dir: &Path,
            _config: &WorkerConfig,
        ) -> std::result::Result<Arc<dyn AppWorker>, WorkerError> {
            let id = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.create_delay).await;
            if self.fail || (self.fail_first && id == 1) {
                return Err(WorkerError::Startup("no entrypoint".into()));
            }
            Ok(Arc::new(FakeWorker {
                id,
                delay: self.fetch_delay,
                stopped: AtomicBool::new(false),
            }))
        }
    }

    #[derive(Default)]
    struct Recorder {
        spawned: AtomicU64,
        terminated: AtomicU64,
    }

    #[async_trait]
    impl WorkerLifecycle for Recorder {
        async fn worker_spawned(&self, _event: &WorkerEvent) {
            self.spawned.fetch_add(1, Ordering::SeqCst);
        }

        async fn worker_terminated(&self, _event: &WorkerEvent) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool_with(factory: FakeFactory, settings: PoolSettings) -> (Arc<WorkerPool>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::new(settings, Arc::new(factory), recorder.clone())
            .with_memory_probe(Arc::new(FixedMemory(None)));
        (Arc::new(pool), recorder)
    }

    fn request() -> WorkerRequest {
        http::Request::builder().uri("/").body(Bytes::new()).unwrap()
    }

    fn config() -> Arc<WorkerConfig> {
        Arc::new(WorkerConfig::default())
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_concurrent_first_access_creates_once() {
        let factory = FakeFactory {
            create_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let (pool, recorder) = pool_with(factory, PoolSettings::default());
        let dir = PathBuf::from("/apps/todo@1.0.0");

        let results = join_all((0..10).map(|_| pool.fetch(&dir, config(), request()))).await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.is_ok()));
        let metrics = pool.metrics();
        assert_eq!(metrics.worker_created_count, 1);
        assert_eq!(metrics.cache_size, 1);
        assert_eq!(recorder.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_requests_evicts_and_recreates() {
        let (pool, recorder) = pool_with(FakeFactory::default(), PoolSettings::default());
        let dir = PathBuf::from("/apps/todo@1.0.0");
        let config = Arc::new(WorkerConfig {
            max_requests: 2,
            ..WorkerConfig::default()
        });

        let first = pool.fetch(&dir, config.clone(), request()).await.unwrap();
        let second = pool.fetch(&dir, config.clone(), request()).await.unwrap();
        assert_eq!(first.body(), second.body());
        assert_eq!(pool.metrics().worker_created_count, 1);

        let third = pool.fetch(&dir, config.clone(), request()).await.unwrap();
        assert_ne!(third.body(), first.body());

        let metrics = pool.metrics();
        assert_eq!(metrics.worker_created_count, 2);
        assert_eq!(metrics.eviction_count, 1);
        wait_for(|| recorder.terminated.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_eviction_does_not_truncate_in_flight() {
        let factory = FakeFactory {
            fetch_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let (pool, _) = pool_with(factory, PoolSettings::default());
        let config = Arc::new(WorkerConfig {
            max_requests: 1,
            ..WorkerConfig::default()
        });

        // the first request already reaches the limit and retires its worker
        let response = pool
            .fetch(Path::new("/apps/a@1.0.0"), config, request())
            .await
            .unwrap();
        assert_eq!(response.body(), &Bytes::from("1"));
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_creation_failure() {
        let factory = FakeFactory {
            fail: true,
            ..Default::default()
        };
        let (pool, recorder) = pool_with(factory, PoolSettings::default());
        let dir = Path::new("/apps/broken@1.0.0");

        let err = pool.get_or_create(dir, config()).await.unwrap_err();
        assert!(matches!(err, Error::WorkerCreation { .. }));
        assert!(pool.is_empty());

        // the key is not poisoned
        let _ = pool.get_or_create(dir, config()).await;
        let metrics = pool.metrics();
        assert_eq!(metrics.worker_failed_count, 2);
        assert_eq!(metrics.worker_created_count, 0);
        assert_eq!(recorder.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_distinct_config_gets_distinct_worker() {
        let (pool, _) = pool_with(FakeFactory::default(), PoolSettings::default());
        let dir = Path::new("/apps/todo@1.0.0");
        let other = Arc::new(WorkerConfig {
            low_memory: true,
            ..WorkerConfig::default()
        });

        let a = pool.get_or_create(dir, config()).await.unwrap();
        let b = pool.get_or_create(dir, other).await.unwrap();
        let c = pool.get_or_create(dir, config()).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), c.id());

        let metrics = pool.metrics();
        assert_eq!(metrics.hit_count, 1);
        assert_eq!(metrics.miss_count, 2);
    }

    #[tokio::test]
    async fn test_idle_workers_are_swept() {
        let (pool, recorder) = pool_with(FakeFactory::default(), PoolSettings::default());
        let config = Arc::new(WorkerConfig {
            timeout_ms: 10,
            idle_timeout_ms: 20,
            ..WorkerConfig::default()
        });
        pool.get_or_create(Path::new("/apps/a@1.0.0"), config)
            .await
            .unwrap();

        assert_eq!(pool.sweep(), 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.sweep(), 1);
        assert!(pool.is_empty());
        wait_for(|| recorder.terminated.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_ttl_expiry_on_access() {
        let (pool, _) = pool_with(FakeFactory::default(), PoolSettings::default());
        let dir = Path::new("/apps/a@1.0.0");
        let config = Arc::new(WorkerConfig {
            timeout_ms: 10,
            ttl_ms: 30,
            ..WorkerConfig::default()
        });

        let first = pool.get_or_create(dir, config.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = pool.get_or_create(dir, config).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(first.is_retired());
    }

    #[tokio::test]
    async fn test_memory_pressure_evicts_low_memory_lru() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::new(
            PoolSettings::default(),
            Arc::new(FakeFactory::default()),
            recorder,
        )
        .with_memory_probe(Arc::new(FixedMemory(Some(0.01))));

        let low = Arc::new(WorkerConfig {
            low_memory: true,
            ..WorkerConfig::default()
        });
        let older = pool
            .get_or_create(Path::new("/apps/a@1.0.0"), low.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = pool
            .get_or_create(Path::new("/apps/b@1.0.0"), low)
            .await
            .unwrap();
        let regular = pool
            .get_or_create(Path::new("/apps/c@1.0.0"), config())
            .await
            .unwrap();

        assert_eq!(pool.sweep(), 1);
        assert!(older.is_retired());
        assert!(!newer.is_retired());
        assert!(!regular.is_retired());
    }

    #[tokio::test]
    async fn test_max_size_retires_lru() {
        let settings = PoolSettings {
            max_size: 1,
            ..PoolSettings::default()
        };
        let (pool, _) = pool_with(FakeFactory::default(), settings);

        let a = pool
            .get_or_create(Path::new("/apps/a@1.0.0"), config())
            .await
            .unwrap();
        pool.get_or_create(Path::new("/apps/b@1.0.0"), config())
            .await
            .unwrap();

        assert!(a.is_retired());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_evict_all() {
        let (pool, _) = pool_with(FakeFactory::default(), PoolSettings::default());
        for name in ["a@1.0.0", "b@1.0.0", "c@1.0.0"] {
            pool.get_or_create(&Path::new("/apps").join(name), config())
                .await
                .unwrap();
        }
        assert_eq!(pool.evict_all(), 3);
        assert!(pool.is_empty());
        assert_eq!(pool.evict_all(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_closes() {
        let factory = FakeFactory {
            fetch_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let (pool, recorder) = pool_with(factory, PoolSettings::default());
        let dir = PathBuf::from("/apps/a@1.0.0");

        let in_flight = {
            let pool = pool.clone();
            let dir = dir.clone();
            tokio::spawn(async move { pool.fetch(&dir, config(), request()).await })
        };
        wait_for(|| pool.instances().iter().any(|i| i.in_flight() == 1)).await;

        pool.shutdown().await;
        assert!(in_flight.await.unwrap().is_ok());
        assert_eq!(recorder.terminated.load(Ordering::SeqCst), 1);

        let err = pool.get_or_create(&dir, config()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_sweeper_stops() {
        let settings = PoolSettings {
            sweep_interval_ms: 5,
            ..PoolSettings::default()
        };
        let (pool, _) = pool_with(FakeFactory::default(), settings);
        let sweeper = pool.start_sweeper();
        tokio::time::sleep(Duration::from_millis(20)).await;
        sweeper.stop().await;
    }

    #[tokio::test]
    async fn test_waiter_retries_after_failed_creation() {
        let factory = FakeFactory {
            create_delay: Duration::from_millis(50),
            fail_first: true,
            ..Default::default()
        };
        let (pool, recorder) = pool_with(factory, PoolSettings::default());
        let dir = PathBuf::from("/apps/todo@1.0.0");

        let (first, second) = tokio::join!(
            pool.get_or_create(&dir, config()),
            pool.get_or_create(&dir, config()),
        );
        assert!(first.is_err());
        let instance = second.unwrap();

        // the waiter's worker is the cached one, not an orphan
        assert_eq!(pool.len(), 1);
        let again = pool.get_or_create(&dir, config()).await.unwrap();
        assert!(Arc::ptr_eq(&instance, &again));

        pool.shutdown().await;
        assert!(instance.is_retired());
        assert_eq!(recorder.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_creation_terminates_new_worker() {
        let factory = FakeFactory {
            create_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let (pool, recorder) = pool_with(factory, PoolSettings::default());

        let creating = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.get_or_create(Path::new("/apps/a@1.0.0"), config()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.shutdown().await;
        assert!(pool.is_closed());

        let err = creating.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(recorder.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.terminated.load(Ordering::SeqCst), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_max_size_holds_under_concurrent_creation() {
        let factory = FakeFactory {
            create_delay: Duration::from_millis(30),
            ..Default::default()
        };
        let settings = PoolSettings {
            max_size: 1,
            ..PoolSettings::default()
        };
        let (pool, recorder) = pool_with(factory, settings);

        let results = join_all(
            ["a@1.0.0", "b@1.0.0", "c@1.0.0"]
                .iter()
                .map(|name| {
                    let dir = Path::new("/apps").join(name);
                    let pool = pool.clone();
                    async move { pool.get_or_create(&dir, config()).await }
                }),
        )
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(pool.len(), 1);
        assert!(pool.metrics().eviction_count >= 2);
        wait_for(|| {
            recorder.terminated.load(Ordering::SeqCst) + 1
                == recorder.spawned.load(Ordering::SeqCst)
        })
        .await;
    }
}
