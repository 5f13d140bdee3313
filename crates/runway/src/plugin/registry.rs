//! Plugin Registry
//!
//! Holds plugins in registration order and runs their hooks. Built once at
//! startup (`register` takes `&mut self`), then shared read-only behind an
//! `Arc`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Method;
use axum::Router;
use runway_worker::{WorkerRequest, WorkerResponse};
use serde::Serialize;
use tracing::{debug, error, info};

use super::reserved::ReservedPaths;
use super::services::ServiceLocator;
use super::websocket::{FanOut, WebSocketHandler};
use super::{short_name, AppMount, FetchHandler, Plugin, PluginContext, RequestFlow, ResponseContext};
use crate::apps::{AppInfo, AppVersion};
use crate::config::WorkerConfigPatch;
use crate::error::{Error, Result};
use crate::pool::{WorkerEvent, WorkerLifecycle, WorkerPool};
use crate::routes::{PublicRoutes, RouteMatcher};

/// Plugin app matched for a request path.
#[derive(Debug, Clone)]
pub struct ResolvedPluginApp {
    pub plugin: String,
    pub dir: PathBuf,
    /// Absolute mount path, without trailing slash ("" for the root).
    pub base_path: String,
    pub config: Option<WorkerConfigPatch>,
}

/// Public description of a registered plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub name: String,
    pub base: String,
    pub dependencies: Vec<String>,
    pub hooks: Vec<&'static str>,
    pub reserved_paths: Vec<String>,
    pub apps: usize,
    pub has_routes: bool,
    pub has_fetch: bool,
}

enum AppMatcher {
    /// One matcher per pattern, with the literal prefix used as base.
    Routes(Vec<(RouteMatcher, String)>),
    Prefix(String),
}

struct CompiledApp {
    dir: PathBuf,
    matcher: AppMatcher,
    config: Option<WorkerConfigPatch>,
}

struct Registered {
    plugin: Plugin,
    base: String,
    public: RouteMatcher,
    apps: Vec<CompiledApp>,
    router: Option<Router>,
}

pub struct PluginRegistry {
    plugins: Vec<Registered>,
    index: HashMap<String, usize>,
    /// Indices of plugins with routers, longest base first.
    router_order: Vec<usize>,
    reserved: ReservedPaths,
    services: Arc<ServiceLocator>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            index: HashMap::new(),
            router_order: Vec::new(),
            reserved: ReservedPaths::new(),
            services: Arc::new(ServiceLocator::new()),
        }
    }

    /// Add `plugin` at the end of the chain.
    ///
    /// Fails when the name is taken or a declared dependency has not been
    /// registered before it.
    pub fn register(&mut self, mut plugin: Plugin) -> Result<()> {
        if self.index.contains_key(&plugin.name) {
            return Err(Error::DuplicatePlugin(plugin.name));
        }
        for dependency in &plugin.dependencies {
            if !self.index.contains_key(dependency) {
                return Err(Error::MissingDependency {
                    plugin: plugin.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        for dependency in &plugin.optional_dependencies {
            if !self.index.contains_key(dependency) {
                debug!(
                    "Optional dependency '{}' of plugin '{}' is not registered",
                    dependency, plugin.name
                );
            }
        }

        let base = match &plugin.base {
            Some(base) => normalize_base(base),
            None => format!("/{}", short_name(&plugin.name)),
        };
        let public = RouteMatcher::compile(&plugin.public_routes, "")?;

        let mut apps = Vec::with_capacity(plugin.apps.len());
        for app in &plugin.apps {
            let matcher = match &app.mount {
                AppMount::Routes(patterns) => {
                    let mut compiled = Vec::with_capacity(patterns.len());
                    for pattern in patterns {
                        let matcher =
                            RouteMatcher::compile(&PublicRoutes::List(vec![pattern.clone()]), "")?;
                        compiled.push((matcher, literal_prefix(pattern)));
                        self.reserved.insert(pattern, &plugin.name);
                    }
                    AppMatcher::Routes(compiled)
                }
                AppMount::Path(path) => {
                    let prefix = normalize_base(path);
                    self.reserved.insert(&prefix, &plugin.name);
                    AppMatcher::Prefix(prefix)
                }
            };
            apps.push(CompiledApp {
                dir: app.dir.clone(),
                matcher,
                config: app.config.clone(),
            });
        }

        let router = plugin.routes.take().map(|router| {
            if base == "/" {
                router
            } else {
                Router::new().nest(&base, router)
            }
        });
        if router.is_some() || plugin.base.is_some() {
            self.reserved.insert(&base, &plugin.name);
        }

        info!(
            "Registered plugin '{}' at {} (hooks: {:?})",
            plugin.name,
            base,
            plugin.hooks.names()
        );

        let idx = self.plugins.len();
        self.index.insert(plugin.name.clone(), idx);
        self.plugins.push(Registered {
            plugin,
            base,
            public,
            apps,
            router,
        });

        if self.plugins[idx].router.is_some() {
            self.router_order.push(idx);
            let plugins = &self.plugins;
            self.router_order
                .sort_by(|a, b| plugins[*b].base.len().cmp(&plugins[*a].base.len()));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.plugin.name.as_str()).collect()
    }

    pub fn base_of(&self, plugin: &str) -> Option<&str> {
        self.index
            .get(plugin)
            .map(|idx| self.plugins[*idx].base.as_str())
    }

    pub fn services(&self) -> &Arc<ServiceLocator> {
        &self.services
    }

    pub fn reserved_paths(&self) -> &ReservedPaths {
        &self.reserved
    }

    /// Fail with `RouteConflict` when `path` collides with a plugin path.
    pub fn check_route_conflict(&self, path: &str) -> Result<()> {
        self.reserved.check(path)
    }

    /// Deployed apps whose name collides with a reserved path, as
    /// `(app, plugin)` pairs.
    pub fn conflicts(&self, apps: &[AppVersion]) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = apps
            .iter()
            .filter_map(|app| {
                self.reserved
                    .owner(&format!("/{}", app.name))
                    .map(|plugin| (app.name.clone(), plugin.to_string()))
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn describe(&self) -> Vec<PluginSummary> {
        self.plugins
            .iter()
            .map(|entry| PluginSummary {
                name: entry.plugin.name.clone(),
                base: entry.base.clone(),
                dependencies: entry.plugin.dependencies.clone(),
                hooks: entry.plugin.hooks.names(),
                reserved_paths: self.reserved.for_plugin(&entry.plugin.name),
                apps: entry.apps.len(),
                has_routes: entry.router.is_some(),
                has_fetch: entry.plugin.fetch.is_some(),
            })
            .collect()
    }

    /// True when the request is public for `plugin`, by its own
    /// `publicRoutes` or by those of the target app.
    pub fn is_public(
        &self,
        plugin: &str,
        method: &Method,
        path: &str,
        app: Option<&AppInfo>,
    ) -> bool {
        match self.index.get(plugin) {
            Some(idx) => is_public(&self.plugins[*idx], method, path, app),
            None => false,
        }
    }

    /// Run every `on_request` hook in order.
    ///
    /// A response short-circuits the chain. A hook error aborts it and is
    /// returned as `Error::Hook`.
    pub async fn run_on_request(
        &self,
        mut request: WorkerRequest,
        app: Option<&Arc<AppInfo>>,
    ) -> Result<RequestFlow> {
        for entry in &self.plugins {
            let Some(hook) = &entry.plugin.hooks.on_request else {
                continue;
            };
            let path = request.uri().path().to_string();
            if is_public(entry, request.method(), &path, app.map(|a| a.as_ref())) {
                debug!(plugin = %entry.plugin.name, "Skipping on_request for public route {}", path);
                continue;
            }

            let flow = hook(request, app.cloned())
                .await
                .map_err(|e| hook_error(&entry.plugin.name, "on_request", e))?;
            match flow {
                RequestFlow::Continue(next) => request = next,
                RequestFlow::Respond(response) => {
                    debug!(plugin = %entry.plugin.name, "on_request answered {}", path);
                    return Ok(RequestFlow::Respond(response));
                }
            }
        }
        Ok(RequestFlow::Continue(request))
    }

    /// Thread the response through every `on_response` hook in order.
    pub async fn run_on_response(
        &self,
        mut response: WorkerResponse,
        ctx: &ResponseContext,
    ) -> Result<WorkerResponse> {
        for entry in &self.plugins {
            if let Some(hook) = &entry.plugin.hooks.on_response {
                response = hook(response, ctx.clone())
                    .await
                    .map_err(|e| hook_error(&entry.plugin.name, "on_response", e))?;
            }
        }
        Ok(response)
    }

    /// Run every `on_init` hook in order. The first failure is fatal.
    pub async fn init_all(&self, pool: Arc<WorkerPool>) -> Result<()> {
        for entry in &self.plugins {
            let Some(hook) = &entry.plugin.hooks.on_init else {
                continue;
            };
            let ctx = PluginContext {
                name: entry.plugin.name.clone(),
                base: entry.base.clone(),
                config: entry.plugin.config.clone(),
                services: self.services.clone(),
                pool: pool.clone(),
            };
            hook(ctx)
                .await
                .map_err(|e| hook_error(&entry.plugin.name, "on_init", e))?;
            debug!("Initialized plugin '{}'", entry.plugin.name);
        }
        Ok(())
    }

    pub async fn run_on_worker_spawn(&self, event: &WorkerEvent) {
        for entry in &self.plugins {
            if let Some(hook) = &entry.plugin.hooks.on_worker_spawn {
                if let Err(e) = hook(event.clone()).await {
                    error!(plugin = %entry.plugin.name, "on_worker_spawn failed: {:#}", e);
                }
            }
        }
    }

    pub async fn run_on_worker_terminate(&self, event: &WorkerEvent) {
        for entry in &self.plugins {
            if let Some(hook) = &entry.plugin.hooks.on_worker_terminate {
                if let Err(e) = hook(event.clone()).await {
                    error!(plugin = %entry.plugin.name, "on_worker_terminate failed: {:#}", e);
                }
            }
        }
    }

    pub async fn run_on_server_start(&self, addr: SocketAddr) {
        for entry in &self.plugins {
            if let Some(hook) = &entry.plugin.hooks.on_server_start {
                if let Err(e) = hook(addr).await {
                    error!(plugin = %entry.plugin.name, "on_server_start failed: {:#}", e);
                }
            }
        }
    }

    /// Run every `on_shutdown` hook in reverse registration order.
    pub async fn shutdown(&self) {
        for entry in self.plugins.iter().rev() {
            if let Some(hook) = &entry.plugin.hooks.on_shutdown {
                if let Err(e) = hook().await {
                    error!(plugin = %entry.plugin.name, "on_shutdown failed: {:#}", e);
                }
            }
        }
    }

    /// The single websocket handler, a fan-out over several, or none.
    pub fn websocket_handler(&self) -> Option<Arc<dyn WebSocketHandler>> {
        let mut handlers: Vec<(String, Arc<dyn WebSocketHandler>)> = self
            .plugins
            .iter()
            .filter_map(|entry| {
                entry
                    .plugin
                    .websocket
                    .clone()
                    .map(|handler| (entry.plugin.name.clone(), handler))
            })
            .collect();

        match handlers.len() {
            0 => None,
            1 => handlers.pop().map(|(_, handler)| handler),
            _ => Some(Arc::new(FanOut::new(handlers))),
        }
    }

    /// Plugins with a full fetch handler, in registration order.
    pub fn fetch_handlers(&self) -> impl Iterator<Item = (&str, &FetchHandler)> {
        self.plugins.iter().filter_map(|entry| {
            entry
                .plugin
                .fetch
                .as_ref()
                .map(|handler| (entry.plugin.name.as_str(), handler))
        })
    }

    /// Plugin routers, longest base path first, already mounted at their base.
    pub fn routers(&self) -> impl Iterator<Item = (&str, &Router)> {
        self.router_order.iter().filter_map(|idx| {
            let entry = &self.plugins[*idx];
            entry
                .router
                .as_ref()
                .map(|router| (entry.base.as_str(), router))
        })
    }

    /// First plugin app (in registration order) mounted at `path`.
    pub fn resolve_plugin_app(&self, path: &str) -> Option<ResolvedPluginApp> {
        for entry in &self.plugins {
            for app in &entry.apps {
                let base_path = match &app.matcher {
                    AppMatcher::Routes(patterns) => patterns
                        .iter()
                        .find(|(matcher, _)| matcher.matches_path(path))
                        .map(|(_, base)| base.clone()),
                    AppMatcher::Prefix(prefix) => under_prefix(path, prefix).then(|| {
                        if prefix == "/" {
                            String::new()
                        } else {
                            prefix.clone()
                        }
                    }),
                };

                if let Some(base_path) = base_path {
                    return Some(ResolvedPluginApp {
                        plugin: entry.plugin.name.clone(),
                        dir: app.dir.clone(),
                        base_path,
                        config: app.config.clone(),
                    });
                }
            }
        }
        None
    }
}

#[async_trait]
impl WorkerLifecycle for PluginRegistry {
    async fn worker_spawned(&self, event: &WorkerEvent) {
        self.run_on_worker_spawn(event).await;
    }

    async fn worker_terminated(&self, event: &WorkerEvent) {
        self.run_on_worker_terminate(event).await;
    }
}

fn is_public(entry: &Registered, method: &Method, path: &str, app: Option<&AppInfo>) -> bool {
    entry.public.matches(method, path)
        || app.is_some_and(|app| app.public_routes.matches(method, path))
}

fn hook_error(plugin: &str, hook: &'static str, err: anyhow::Error) -> Error {
    Error::Hook {
        plugin: plugin.to_string(),
        hook,
        message: format!("{:#}", err),
    }
}

/// Leading slash, no trailing slash, `/` for the root.
fn normalize_base(base: &str) -> String {
    let trimmed = base.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Literal part of a glob before its first wildcard, as a mount path.
fn literal_prefix(pattern: &str) -> String {
    let literal = match pattern.find(['*', '?']) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    };
    let trimmed = literal.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn under_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use axum::routing::get;
    use bytes::Bytes;
    use http::StatusCode;

    use crate::apps::AppOwner;
    use crate::config::WorkerConfig;

    fn request(method: Method, path: &str) -> WorkerRequest {
        http::Request::builder()
            .method(method)
            .uri(path)
            .body(Bytes::new())
            .unwrap()
    }

    fn response(status: StatusCode, body: &'static str) -> WorkerResponse {
        http::Response::builder()
            .status(status)
            .body(Bytes::from_static(body.as_bytes()))
            .unwrap()
    }

    #[test]
    fn test_duplicate_and_missing_dependency() {
        let mut registry = PluginRegistry::new();
        registry.register(Plugin::new("auth")).unwrap();

        let err = registry.register(Plugin::new("auth")).unwrap_err();
        assert!(matches!(err, Error::DuplicatePlugin(ref name) if name == "auth"));

        let err = registry
            .register(Plugin::new("admin").depends_on("logs"))
            .unwrap_err();
        assert!(matches!(err, Error::MissingDependency { ref dependency, .. } if dependency == "logs"));

        registry
            .register(Plugin::new("admin").depends_on("auth"))
            .unwrap();
        assert_eq!(registry.names(), vec!["auth", "admin"]);
    }

    #[test]
    fn test_default_base() {
        let mut registry = PluginRegistry::new();
        registry.register(Plugin::new("@acme/plugin-auth")).unwrap();
        registry.register(Plugin::new("logs").base("/_logs/")).unwrap();
        assert_eq!(registry.base_of("@acme/plugin-auth"), Some("/auth"));
        assert_eq!(registry.base_of("logs"), Some("/_logs"));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_later_plugins() {
        let reached = Arc::new(AtomicUsize::new(0));
        let counter = reached.clone();

        let mut registry = PluginRegistry::new();
        registry
            .register(Plugin::new("a").on_request(|_, _| async {
                Ok(RequestFlow::Respond(response(StatusCode::UNAUTHORIZED, "no")))
            }))
            .unwrap();
        registry
            .register(Plugin::new("b").on_request(move |req, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(RequestFlow::Continue(req))
                }
            }))
            .unwrap();

        let flow = registry
            .run_on_request(request(Method::GET, "/x"), None)
            .await
            .unwrap();
        match flow {
            RequestFlow::Respond(res) => assert_eq!(res.status(), StatusCode::UNAUTHORIZED),
            RequestFlow::Continue(_) => panic!("expected a response"),
        }
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_replacement_request_is_threaded() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Plugin::new("tag").on_request(|mut req, _| async move {
                req.headers_mut().insert("x-user", "alice".parse().unwrap());
                Ok(RequestFlow::Continue(req))
            }))
            .unwrap();
        registry
            .register(Plugin::new("check").on_request(|req, _| async move {
                anyhow::ensure!(req.headers().contains_key("x-user"), "missing user");
                Ok(RequestFlow::Continue(req))
            }))
            .unwrap();

        let flow = registry
            .run_on_request(request(Method::GET, "/x"), None)
            .await
            .unwrap();
        assert!(matches!(flow, RequestFlow::Continue(ref req) if req.headers()["x-user"] == "alice"));
    }

    #[tokio::test]
    async fn test_public_routes_skip_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut registry = PluginRegistry::new();
        registry
            .register(
                Plugin::new("auth")
                    .public_routes(PublicRoutes::List(vec!["/login".into(), "/assets/**".into()]))
                    .on_request(move |req, _| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(RequestFlow::Continue(req))
                        }
                    }),
            )
            .unwrap();

        for path in ["/login", "/assets/app.css"] {
            registry
                .run_on_request(request(Method::GET, path), None)
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(registry.is_public("auth", &Method::POST, "/login", None));

        // the target app's public routes count too, anchored at its base
        let app = Arc::new(AppInfo {
            name: "todo".into(),
            owner: AppOwner::Deployed,
            dir: PathBuf::from("/apps/todo@1.0.0"),
            base_path: "/todo".into(),
            config: Arc::new(WorkerConfig::default()),
            public_routes: Arc::new(
                RouteMatcher::compile(&PublicRoutes::List(vec!["/health".into()]), "/todo")
                    .unwrap(),
            ),
        });
        registry
            .run_on_request(request(Method::GET, "/todo/health"), Some(&app))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry
            .run_on_request(request(Method::GET, "/todo/items"), Some(&app))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_hook_error_is_fatal() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Plugin::new("auth").on_request(|_, _| async {
                Err(anyhow::anyhow!("token store offline"))
            }))
            .unwrap();

        let err = registry
            .run_on_request(request(Method::GET, "/x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Hook { ref plugin, hook: "on_request", .. } if plugin == "auth"));
    }

    #[tokio::test]
    async fn test_lifecycle_errors_are_isolated_and_shutdown_is_reversed() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();

        for name in ["first", "second", "third"] {
            let order = order.clone();
            let plugin = Plugin::new(name).on_shutdown(move || {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(name);
                    if name == "third" {
                        anyhow::bail!("cleanup failed");
                    }
                    Ok(())
                }
            });
            registry.register(plugin).unwrap();
        }

        registry.shutdown().await;
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_worker_hooks_keep_going_after_errors() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let mut registry = PluginRegistry::new();
        registry
            .register(Plugin::new("broken").on_worker_spawn(|_| async { Err(anyhow::anyhow!("nope")) }))
            .unwrap();
        registry
            .register(Plugin::new("counter").on_worker_spawn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();

        let event = WorkerEvent {
            worker_id: 1,
            dir: PathBuf::from("/apps/a@1.0.0"),
            reason: None,
        };
        registry.worker_spawned(&event).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_response_hooks_thread_in_order() {
        let mut registry = PluginRegistry::new();
        for tag in ["a", "b"] {
            registry
                .register(Plugin::new(tag).on_response(move |mut res, _| async move {
                    let mut body = res.body().to_vec();
                    body.extend_from_slice(tag.as_bytes());
                    *res.body_mut() = Bytes::from(body);
                    Ok(res)
                }))
                .unwrap();
        }

        let ctx = ResponseContext {
            method: Method::GET,
            path: "/".into(),
            started: std::time::Instant::now(),
            app: None,
        };
        let res = registry
            .run_on_response(response(StatusCode::OK, "x"), &ctx)
            .await
            .unwrap();
        assert_eq!(res.body(), &Bytes::from_static(b"xab"));
    }

    #[test]
    fn test_resolve_plugin_app() {
        let mut registry = PluginRegistry::new();
        registry
            .register(
                Plugin::new("admin")
                    .app(crate::plugin::PluginApp::routes("/srv/admin-ui", ["/admin/**"]))
                    .app(crate::plugin::PluginApp::path("/srv/docs", "/docs")),
            )
            .unwrap();

        let found = registry.resolve_plugin_app("/admin/users/1").unwrap();
        assert_eq!(found.plugin, "admin");
        assert_eq!(found.base_path, "/admin");
        assert_eq!(found.dir, PathBuf::from("/srv/admin-ui"));

        let found = registry.resolve_plugin_app("/docs/intro").unwrap();
        assert_eq!(found.base_path, "/docs");
        assert!(registry.resolve_plugin_app("/docsify").is_none());
        assert!(registry.resolve_plugin_app("/todo").is_none());
    }

    #[test]
    fn test_reserved_paths_and_conflicts() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Plugin::new("todo-plugin").base("/todo").routes(
                Router::new().route("/", get(|| async { "plugin" })),
            ))
            .unwrap();
        registry
            .register(Plugin::new("admin").app(crate::plugin::PluginApp::routes(
                "/srv/admin",
                ["/admin/ui/**"],
            )))
            .unwrap();

        assert!(matches!(
            registry.check_route_conflict("/todo"),
            Err(Error::RouteConflict { .. })
        ));
        assert!(registry.check_route_conflict("/admin").is_err());
        assert!(registry.check_route_conflict("/notes").is_ok());

        let summary = registry.describe();
        assert_eq!(summary[0].reserved_paths, vec!["/todo".to_string()]);
        assert!(summary[0].has_routes);
    }

    #[test]
    fn test_routers_longest_base_first() {
        let mut registry = PluginRegistry::new();
        for base in ["/a", "/a/b/c", "/a/b"] {
            registry
                .register(
                    Plugin::new(base.replace('/', "_"))
                        .base(base)
                        .routes(Router::new().route("/", get(|| async { "ok" }))),
                )
                .unwrap();
        }
        let bases: Vec<&str> = registry.routers().map(|(base, _)| base).collect();
        assert_eq!(bases, vec!["/a/b/c", "/a/b", "/a"]);
    }

    #[test]
    fn test_websocket_composition() {
        struct Echo;

        #[async_trait]
        impl WebSocketHandler for Echo {
            async fn on_message(
                &self,
                conn: &crate::plugin::WsConnection,
                message: crate::plugin::WsMessage,
            ) -> anyhow::Result<()> {
                conn.send(message).await;
                Ok(())
            }
        }

        let mut registry = PluginRegistry::new();
        assert!(registry.websocket_handler().is_none());

        registry
            .register(Plugin::new("one").websocket(Arc::new(Echo)))
            .unwrap();
        assert!(registry.websocket_handler().is_some());

        registry
            .register(Plugin::new("two").websocket(Arc::new(Echo)))
            .unwrap();
        assert!(registry.websocket_handler().is_some());
    }

    #[test]
    fn test_optional_dependency_may_be_absent() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Plugin::new("dashboard").optionally_depends_on("metrics"))
            .unwrap();
        registry
            .register(Plugin::new("admin").optionally_depends_on("dashboard"))
            .unwrap();
        assert_eq!(registry.names(), vec!["dashboard", "admin"]);
    }

    #[tokio::test]
    async fn test_init_reads_typed_config() {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AuthConfig {
            session_ttl: u64,
            #[serde(default)]
            realm: Option<String>,
        }

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();

        let mut registry = PluginRegistry::new();
        registry
            .register(
                Plugin::new("@acme/plugin-auth")
                    .config(serde_json::json!({ "sessionTtl": 60 }))
                    .on_init(move |ctx| {
                        let sink = sink.clone();
                        async move {
                            let config: AuthConfig = ctx.config_as()?;
                            *sink.lock().unwrap() = Some((ctx.base.clone(), config.session_ttl, config.realm));
                            Ok(())
                        }
                    }),
            )
            .unwrap();
        registry
            .register(Plugin::new("strict").on_init(|ctx| async move {
                // no config section at all still yields the defaults
                let _: std::collections::HashMap<String, u64> = ctx.config_as()?;
                let _: AuthConfig = ctx.config_as()?;
                Ok(())
            }))
            .unwrap();

        let pool = Arc::new(WorkerPool::new(
            crate::config::PoolSettings::default(),
            Arc::new(crate::pool::ThreadWorkerFactory::new(
                crate::config::WorkerSettings::default(),
            )),
            Arc::new(crate::pool::NoopLifecycle),
        ));

        // `strict` needs sessionTtl, which it was never given
        let err = registry.init_all(pool).await.unwrap_err();
        assert!(matches!(err, Error::Hook { ref plugin, .. } if plugin == "strict"));
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(("/auth".to_string(), 60, None))
        );
    }
}
