//! Server Application State
//!
//! Shared state handed to every handler.

use std::sync::Arc;
use std::time::Instant;

use crate::apps::{AppStore, VersionResolver};
use crate::config::{ConfigCache, RuntimeConfig};
use crate::plugin::{PluginRegistry, WebSocketHandler};
use crate::pool::WorkerPool;
use crate::routes::MatcherCache;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: RuntimeConfig,

    /// Plugins, read-only after startup
    registry: Arc<PluginRegistry>,

    /// Live workers
    pool: Arc<WorkerPool>,

    /// App name -> version directory
    resolver: VersionResolver,

    /// Deployment file operations
    store: AppStore,

    /// Per-app worker configs
    configs: ConfigCache,

    /// Compiled app `publicRoutes`
    matchers: MatcherCache,

    /// Composed plugin websocket handler
    websocket: Option<Arc<dyn WebSocketHandler>>,

    started_at: Instant,
}

impl AppState {
    /// Create new application state. Must run inside a tokio runtime.
    pub fn new(config: RuntimeConfig, registry: Arc<PluginRegistry>, pool: Arc<WorkerPool>) -> Self {
        let resolver = VersionResolver::new(config.apps_dirs.clone());
        let store = AppStore::new(config.apps_dirs.clone(), registry.reserved_paths().clone());
        let websocket = registry.websocket_handler();

        Self {
            inner: Arc::new(AppStateInner {
                config,
                registry,
                pool,
                resolver,
                store,
                configs: ConfigCache::new(),
                matchers: MatcherCache::new(),
                websocket,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.inner.resolver
    }

    pub fn store(&self) -> &AppStore {
        &self.inner.store
    }

    pub fn configs(&self) -> &ConfigCache {
        &self.inner.configs
    }

    pub fn matchers(&self) -> &MatcherCache {
        &self.inner.matchers
    }

    pub fn websocket(&self) -> Option<&Arc<dyn WebSocketHandler>> {
        self.inner.websocket.as_ref()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.inner.started_at.elapsed()
    }
}
