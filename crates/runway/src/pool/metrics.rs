//! Pool counters and their serializable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub created: AtomicU64,
    pub failed: AtomicU64,
    pub requests: AtomicU64,
    pub request_micros: AtomicU64,
}

impl Counters {
    pub fn record_request(&self, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.request_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache_size: usize, workers: Vec<WorkerSnapshot>) -> PoolMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let requests = self.requests.load(Ordering::Relaxed);
        let micros = self.request_micros.load(Ordering::Relaxed);

        let lookups = hits + misses;
        PoolMetrics {
            cache_size,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            eviction_count: self.evictions.load(Ordering::Relaxed),
            hit_count: hits,
            miss_count: misses,
            worker_created_count: self.created.load(Ordering::Relaxed),
            worker_failed_count: self.failed.load(Ordering::Relaxed),
            avg_request_duration: if requests == 0 {
                0.0
            } else {
                micros as f64 / requests as f64 / 1000.0
            },
            workers,
        }
    }
}

/// Point-in-time pool metrics. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub cache_size: usize,
    pub cache_hit_rate: f64,
    pub eviction_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub worker_created_count: u64,
    pub worker_failed_count: u64,
    pub avg_request_duration: f64,
    pub workers: Vec<WorkerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: u64,
    pub dir: String,
    pub request_count: u64,
    pub in_flight: usize,
    pub age_ms: u64,
    pub idle_ms: u64,
}
