//! Serves pool metrics under the plugin base and counts worker lifecycle
//! events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::error_response;
use crate::plugin::Plugin;
use crate::pool::{PoolMetrics, WorkerPool};

pub const NAME: &str = "metrics";

/// Registered in the service locator under [`NAME`].
#[derive(Default)]
pub struct MetricsState {
    pool: OnceLock<Arc<WorkerPool>>,
    spawned: AtomicU64,
    terminated: AtomicU64,
}

impl MetricsState {
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn terminated(&self) -> u64 {
        self.terminated.load(Ordering::Relaxed)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsResponse {
    pool: PoolMetrics,
    workers_spawned: u64,
    workers_terminated: u64,
}

pub fn plugin() -> Plugin {
    let state = Arc::new(MetricsState::default());

    let router = Router::new()
        .route("/", get(metrics))
        .with_state(state.clone());

    let init_state = state.clone();
    let spawn_state = state.clone();
    let terminate_state = state;

    Plugin::new(NAME)
        .routes(router)
        .on_init(move |ctx| {
            let state = init_state.clone();
            async move {
                let _ = state.pool.set(ctx.pool.clone());
                ctx.services.register(NAME, state);
                Ok(())
            }
        })
        .on_worker_spawn(move |_| {
            spawn_state.spawned.fetch_add(1, Ordering::Relaxed);
            async { Ok(()) }
        })
        .on_worker_terminate(move |_| {
            terminate_state.terminated.fetch_add(1, Ordering::Relaxed);
            async { Ok(()) }
        })
}

async fn metrics(State(state): State<Arc<MetricsState>>) -> Response {
    match state.pool.get() {
        Some(pool) => Json(MetricsResponse {
            pool: pool.metrics(),
            workers_spawned: state.spawned(),
            workers_terminated: state.terminated(),
        })
        .into_response(),
        None => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "NOT_READY",
            "metrics plugin is not initialized",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    use crate::config::{PoolSettings, WorkerSettings};
    use crate::plugin::PluginRegistry;
    use crate::pool::{NoopLifecycle, ThreadWorkerFactory};

    #[tokio::test]
    async fn test_serves_metrics_after_init() {
        let mut registry = PluginRegistry::new();
        registry.register(plugin()).unwrap();

        let pool = Arc::new(WorkerPool::new(
            PoolSettings::default(),
            Arc::new(ThreadWorkerFactory::new(WorkerSettings::default())),
            Arc::new(NoopLifecycle),
        ));
        registry.init_all(pool).await.unwrap();
        assert!(registry.services().contains(NAME));

        let (base, router) = registry.routers().next().unwrap();
        assert_eq!(base, "/metrics");

        let request = http::Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["workersSpawned"], 0);
        assert_eq!(body["pool"]["cacheSize"], 0);
    }

    #[tokio::test]
    async fn test_not_ready_before_init() {
        let response = metrics(State(Arc::new(MetricsState::default()))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
