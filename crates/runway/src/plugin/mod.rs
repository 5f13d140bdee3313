//! Plugins
//!
//! A plugin is a statically registered extension. Everything it provides is
//! optional: request/response hooks, lifecycle hooks, an axum router mounted
//! under its base path, a full fetch handler, apps served through the
//! worker pool and a websocket handler.
//!
//! Registration order is execution order.

pub mod builtin;
mod registry;
mod reserved;
mod services;
pub mod websocket;

pub use registry::{PluginRegistry, PluginSummary, ResolvedPluginApp};
pub use reserved::ReservedPaths;
pub use services::ServiceLocator;
pub use websocket::{FanOut, WebSocketHandler, WsConnection, WsMessage};

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::http::Method;
use axum::Router;
use futures::future::BoxFuture;
use runway_worker::{WorkerRequest, WorkerResponse};
use serde::de::DeserializeOwned;

use crate::apps::AppInfo;
use crate::config::WorkerConfigPatch;
use crate::pool::{WorkerEvent, WorkerPool};
use crate::routes::PublicRoutes;

/// Outcome of a request hook.
#[derive(Debug)]
pub enum RequestFlow {
    /// Keep going with this request (the original or a replacement).
    Continue(WorkerRequest),
    /// Stop the chain and answer with this response.
    Respond(WorkerResponse),
}

/// What a response hook knows about the request it answers.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub method: Method,
    pub path: String,
    pub started: Instant,
    pub app: Option<Arc<AppInfo>>,
}

/// Handed to `on_init`.
#[derive(Clone)]
pub struct PluginContext {
    pub name: String,
    pub base: String,
    pub config: serde_json::Value,
    pub services: Arc<ServiceLocator>,
    pub pool: Arc<WorkerPool>,
}

impl PluginContext {
    /// Deserialize the plugin's config section.
    pub fn config_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let value = if self.config.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.config.clone()
        };
        Ok(serde_json::from_value(value)?)
    }
}

pub type InitHook = Arc<dyn Fn(PluginContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type RequestHook = Arc<
    dyn Fn(WorkerRequest, Option<Arc<AppInfo>>) -> BoxFuture<'static, anyhow::Result<RequestFlow>>
        + Send
        + Sync,
>;
pub type ResponseHook = Arc<
    dyn Fn(WorkerResponse, ResponseContext) -> BoxFuture<'static, anyhow::Result<WorkerResponse>>
        + Send
        + Sync,
>;
pub type WorkerHook = Arc<dyn Fn(WorkerEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type ServerStartHook =
    Arc<dyn Fn(SocketAddr) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type ShutdownHook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type FetchHandler =
    Arc<dyn Fn(WorkerRequest) -> BoxFuture<'static, anyhow::Result<WorkerResponse>> + Send + Sync>;

/// Optional hooks of a plugin. Absent hooks are skipped.
#[derive(Default, Clone)]
pub struct PluginHooks {
    pub on_init: Option<InitHook>,
    pub on_request: Option<RequestHook>,
    pub on_response: Option<ResponseHook>,
    pub on_worker_spawn: Option<WorkerHook>,
    pub on_worker_terminate: Option<WorkerHook>,
    pub on_server_start: Option<ServerStartHook>,
    pub on_shutdown: Option<ShutdownHook>,
}

impl PluginHooks {
    /// Names of the hooks that are present.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.on_init.is_some() {
            names.push("on_init");
        }
        if self.on_request.is_some() {
            names.push("on_request");
        }
        if self.on_response.is_some() {
            names.push("on_response");
        }
        if self.on_worker_spawn.is_some() {
            names.push("on_worker_spawn");
        }
        if self.on_worker_terminate.is_some() {
            names.push("on_worker_terminate");
        }
        if self.on_server_start.is_some() {
            names.push("on_server_start");
        }
        if self.on_shutdown.is_some() {
            names.push("on_shutdown");
        }
        names
    }
}

/// How a plugin app is mounted.
#[derive(Debug, Clone, PartialEq)]
pub enum AppMount {
    /// Glob patterns over the absolute request path.
    Routes(Vec<String>),
    /// Plain path prefix.
    Path(String),
}

/// An app a plugin serves through the worker pool.
#[derive(Debug, Clone)]
pub struct PluginApp {
    pub dir: PathBuf,
    pub mount: AppMount,
    pub config: Option<WorkerConfigPatch>,
}

impl PluginApp {
    pub fn routes<I, S>(dir: impl Into<PathBuf>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dir: dir.into(),
            mount: AppMount::Routes(patterns.into_iter().map(Into::into).collect()),
            config: None,
        }
    }

    pub fn path(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            mount: AppMount::Path(prefix.into()),
            config: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfigPatch) -> Self {
        self.config = Some(config);
        self
    }
}

/// A plugin definition, built with chained setters.
pub struct Plugin {
    pub(crate) name: String,
    pub(crate) dependencies: Vec<String>,
    pub(crate) optional_dependencies: Vec<String>,
    pub(crate) base: Option<String>,
    pub(crate) config: serde_json::Value,
    pub(crate) routes: Option<Router>,
    pub(crate) fetch: Option<FetchHandler>,
    pub(crate) apps: Vec<PluginApp>,
    pub(crate) public_routes: PublicRoutes,
    pub(crate) websocket: Option<Arc<dyn WebSocketHandler>>,
    pub(crate) hooks: PluginHooks,
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            optional_dependencies: Vec::new(),
            base: None,
            config: serde_json::Value::Null,
            routes: None,
            fetch: None,
            apps: Vec::new(),
            public_routes: PublicRoutes::default(),
            websocket: None,
            hooks: PluginHooks::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depends_on(mut self, plugin: impl Into<String>) -> Self {
        self.dependencies.push(plugin.into());
        self
    }

    pub fn optionally_depends_on(mut self, plugin: impl Into<String>) -> Self {
        self.optional_dependencies.push(plugin.into());
        self
    }

    /// Override the default `/{shortName}` base path.
    pub fn base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Routes mounted under the plugin base. Repeated calls are merged.
    pub fn routes(mut self, router: Router) -> Self {
        self.routes = Some(match self.routes.take() {
            Some(existing) => existing.merge(router),
            None => router,
        });
        self
    }

    /// Full handler consulted before app routing. A 404 means "not mine".
    pub fn fetch<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WorkerRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<WorkerResponse>> + Send + 'static,
    {
        self.fetch = Some(Arc::new(move |req| Box::pin(handler(req))));
        self
    }

    pub fn app(mut self, app: PluginApp) -> Self {
        self.apps.push(app);
        self
    }

    pub fn public_routes(mut self, routes: PublicRoutes) -> Self {
        self.public_routes = routes;
        self
    }

    pub fn websocket(mut self, handler: Arc<dyn WebSocketHandler>) -> Self {
        self.websocket = Some(handler);
        self
    }

    pub fn on_init<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.on_init = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    pub fn on_request<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(WorkerRequest, Option<Arc<AppInfo>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<RequestFlow>> + Send + 'static,
    {
        self.hooks.on_request = Some(Arc::new(move |req, app| Box::pin(hook(req, app))));
        self
    }

    pub fn on_response<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(WorkerResponse, ResponseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<WorkerResponse>> + Send + 'static,
    {
        self.hooks.on_response = Some(Arc::new(move |res, ctx| Box::pin(hook(res, ctx))));
        self
    }

    pub fn on_worker_spawn<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(WorkerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.on_worker_spawn = Some(Arc::new(move |event| Box::pin(hook(event))));
        self
    }

    pub fn on_worker_terminate<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(WorkerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.on_worker_terminate = Some(Arc::new(move |event| Box::pin(hook(event))));
        self
    }

    pub fn on_server_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.on_server_start = Some(Arc::new(move |addr| Box::pin(hook(addr))));
        self
    }

    pub fn on_shutdown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.on_shutdown = Some(Arc::new(move || Box::pin(hook())));
        self
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("base", &self.base)
            .field("hooks", &self.hooks.names())
            .finish()
    }
}

/// Package name without `@scope/` and `plugin-` prefixes.
pub fn short_name(name: &str) -> &str {
    let name = match name.strip_prefix('@') {
        Some(scoped) => scoped.split_once('/').map(|(_, rest)| rest).unwrap_or(scoped),
        None => name,
    };
    name.strip_prefix("plugin-").unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("@acme/plugin-auth"), "auth");
        assert_eq!(short_name("plugin-logs"), "logs");
        assert_eq!(short_name("metrics"), "metrics");
        assert_eq!(short_name("@acme/dashboard"), "dashboard");
    }

    #[test]
    fn test_hook_names() {
        let plugin = Plugin::new("x")
            .on_request(|req, _| async move { Ok(RequestFlow::Continue(req)) })
            .on_shutdown(|| async { Ok(()) });
        assert_eq!(plugin.hooks.names(), vec!["on_request", "on_shutdown"]);
    }
}
