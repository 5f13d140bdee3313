//! A pooled worker and its bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use runway_worker::{WorkerError, WorkerRequest, WorkerResponse};
use tokio::sync::Notify;

use super::metrics::WorkerSnapshot;
use super::EvictionReason;
use crate::config::{WorkerConfig, WorkerKey};

/// The execution context behind a [`WorkerInstance`].
#[async_trait]
pub trait AppWorker: Send + Sync + 'static {
    fn id(&self) -> u64;

    async fn fetch(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError>;

    /// Stop the worker. In-flight fetches fail with `Terminated`.
    async fn shutdown(&self);
}

/// A live worker bound to one [`WorkerKey`].
pub struct WorkerInstance {
    key: WorkerKey,
    config: Arc<WorkerConfig>,
    worker: Arc<dyn AppWorker>,
    created_at: Instant,
    last_used: Mutex<Instant>,
    request_count: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
    retired: AtomicBool,
}

impl WorkerInstance {
    pub(crate) fn new(key: WorkerKey, config: Arc<WorkerConfig>, worker: Arc<dyn AppWorker>) -> Self {
        let now = Instant::now();
        Self {
            key,
            config,
            worker,
            created_at: now,
            last_used: Mutex::new(now),
            request_count: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.worker.id()
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn config(&self) -> &Arc<WorkerConfig> {
        &self.config
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Register a request. `None` once the instance is retired.
    pub(crate) fn begin(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.is_retired() {
            self.finish();
            return None;
        }

        *self.last_used.lock() = Instant::now();
        let count = self.request_count.fetch_add(1, Ordering::SeqCst) + 1;
        Some(InFlightGuard {
            instance: self,
            count,
        })
    }

    fn finish(&self) {
        *self.last_used.lock() = Instant::now();
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn worker(&self) -> &Arc<dyn AppWorker> {
        &self.worker
    }

    /// Mark retired. Returns false when it already was.
    pub(crate) fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::SeqCst)
    }

    /// Why the instance should go, judged at `now`. Busy instances are
    /// never idle.
    pub(crate) fn expiry(&self, now: Instant) -> Option<EvictionReason> {
        if let Some(ttl) = self.config.ttl() {
            if now.duration_since(self.created_at) >= ttl {
                return Some(EvictionReason::Ttl);
            }
        }
        if self.request_count() >= self.config.max_requests {
            return Some(EvictionReason::MaxRequests);
        }
        if self.in_flight() == 0
            && now.duration_since(self.last_used()) >= self.config.idle_timeout()
        {
            return Some(EvictionReason::Idle);
        }
        None
    }

    /// Wait until no request is in flight, at most `limit`.
    pub(crate) async fn drain(&self, limit: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, wait).await.is_ok()
    }

    pub(crate) fn snapshot(&self, now: Instant) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id(),
            dir: self.key.dir.display().to_string(),
            request_count: self.request_count(),
            in_flight: self.in_flight(),
            age_ms: now.duration_since(self.created_at).as_millis() as u64,
            idle_ms: now.duration_since(self.last_used()).as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("id", &self.id())
            .field("dir", &self.key.dir)
            .field("request_count", &self.request_count())
            .field("in_flight", &self.in_flight())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Keeps an instance marked busy for the lifetime of one request.
pub(crate) struct InFlightGuard<'a> {
    instance: &'a WorkerInstance,
    /// Position of this request in the instance's lifetime, starting at 1.
    pub count: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.instance.finish();
    }
}
