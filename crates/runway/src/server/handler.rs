//! Request Dispatcher
//!
//! Fallback handler for everything outside the internal API. Per request:
//!
//! 1. plugin fetch handlers (request hooks first, unless public for that
//!    plugin); a non-404 answer is final
//! 2. resolve the target app: plugin apps first, then the first path
//!    segment as a deployed app
//! 3. request hooks with the app context; a response short-circuits
//! 4. websocket upgrade, when a plugin handles websockets
//! 5. plugin app through the pool
//! 6. plugin routers, longest base first; a non-404 answer is final
//! 7. deployed app through the pool, 404 when there is none
//!
//! Response hooks run over whatever the pipeline produced.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use runway_worker::{WorkerRequest, WorkerResponse, BASE_HEADER};
use tower::ServiceExt;
use tracing::{debug, error};

use super::state::AppState;
use super::ws::handle_websocket;
use crate::apps::{AppInfo, AppOwner};
use crate::error::{error_response, Error, Result};
use crate::plugin::{RequestFlow, ResolvedPluginApp, ResponseContext};

/// Result of the pipeline before response hooks.
enum Outcome {
    /// Goes through `on_response` hooks.
    Buffered(WorkerResponse, Option<Arc<AppInfo>>),
    /// Sent as is (websocket upgrades).
    Raw(Response),
}

/// Fallback handler
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let result = match pipeline(&state, request).await {
        Ok(Outcome::Raw(response)) => return response,
        Ok(Outcome::Buffered(response, app)) => {
            let ctx = ResponseContext {
                method,
                path,
                started,
                app,
            };
            state.registry().run_on_response(response, &ctx).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(response) => into_axum(response),
        Err(e) => e.into_response(),
    }
}

async fn pipeline(state: &AppState, request: Request) -> Result<Outcome> {
    let registry = state.registry();
    let (mut parts, body) = request.into_parts();

    let upgrade = if state.websocket().is_some() && wants_upgrade(&parts.headers) {
        WebSocketUpgrade::from_request_parts(&mut parts, state).await.ok()
    } else {
        None
    };

    let body = axum::body::to_bytes(body, state.config().body_limit_bytes)
        .await
        .map_err(|e| Error::validation(format!("failed to read request body: {}", e)))?;
    let mut request = WorkerRequest::from_parts(parts, body);
    let path = request.uri().path().to_string();

    // Full plugin handlers get the first look.
    for (plugin, handler) in registry.fetch_handlers() {
        if !registry.is_public(plugin, request.method(), &path, None) {
            match registry.run_on_request(request, None).await? {
                RequestFlow::Respond(response) => return Ok(Outcome::Buffered(response, None)),
                RequestFlow::Continue(next) => request = next,
            }
        }

        let response = handler(clone_request(&request)).await.map_err(|e| Error::Hook {
            plugin: plugin.to_string(),
            hook: "fetch",
            message: format!("{:#}", e),
        })?;
        if response.status() != StatusCode::NOT_FOUND {
            return Ok(Outcome::Buffered(response, None));
        }
    }

    let plugin_app = registry.resolve_plugin_app(&path);
    let app = match &plugin_app {
        Some(found) => Some(plugin_app_info(state, found).await?),
        None => deployed_app_info(state, &path).await?,
    };

    let request = match registry.run_on_request(request, app.as_ref()).await? {
        RequestFlow::Respond(response) => return Ok(Outcome::Buffered(response, app)),
        RequestFlow::Continue(request) => request,
    };

    if let (Some(upgrade), Some(handler)) = (upgrade, state.websocket()) {
        let handler = handler.clone();
        let ws_path = path.clone();
        debug!("Upgrading websocket on {}", ws_path);
        let response = upgrade.on_upgrade(move |socket| handle_websocket(socket, handler, ws_path));
        return Ok(Outcome::Raw(response));
    }

    if let (Some(_), Some(app)) = (&plugin_app, &app) {
        let response = match forward(state, app, request).await {
            Ok(response) => response,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                error!("Plugin app {} failed: {}", app.dir.display(), e);
                buffered_error(StatusCode::INTERNAL_SERVER_ERROR, e.code(), &e.to_string())
            }
        };
        return Ok(Outcome::Buffered(response, Some(app.clone())));
    }

    for (base, router) in registry.routers() {
        if !under_base(&path, base) {
            continue;
        }
        let response = router
            .clone()
            .oneshot(clone_request(&request).map(Body::from))
            .await
            .unwrap_or_else(|never| match never {});
        if response.status() != StatusCode::NOT_FOUND {
            let response = buffer(response, state.config().body_limit_bytes).await?;
            return Ok(Outcome::Buffered(response, app));
        }
    }

    match app {
        Some(app) => {
            let response = forward(state, &app, request).await?;
            Ok(Outcome::Buffered(response, Some(app)))
        }
        None => Err(Error::not_found(format!("no app serves {}", path))),
    }
}

async fn plugin_app_info(state: &AppState, found: &ResolvedPluginApp) -> Result<Arc<AppInfo>> {
    let config = state
        .configs()
        .resolve(&found.dir, found.config.as_ref())
        .await?;
    let public_routes = state
        .matchers()
        .get(&config.public_routes, &found.base_path)?;

    Ok(Arc::new(AppInfo {
        name: found.plugin.clone(),
        owner: AppOwner::Plugin(found.plugin.clone()),
        dir: found.dir.clone(),
        base_path: found.base_path.clone(),
        config,
        public_routes,
    }))
}

/// The deployed app addressed by the first path segment, if any.
async fn deployed_app_info(state: &AppState, path: &str) -> Result<Option<Arc<AppInfo>>> {
    let Some(segment) = path.split('/').find(|s| !s.is_empty()) else {
        return Ok(None);
    };

    let version = match state.resolver().resolve(segment).await {
        Ok(version) => version,
        Err(Error::NotFound(_) | Error::Validation(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    let base_path = format!("/{}", segment);
    let config = state.configs().resolve(&version.dir, None).await?;
    let public_routes = state.matchers().get(&config.public_routes, &base_path)?;

    Ok(Some(Arc::new(AppInfo {
        name: version.name,
        owner: AppOwner::Deployed,
        dir: version.dir,
        base_path,
        config,
        public_routes,
    })))
}

async fn forward(state: &AppState, app: &AppInfo, request: WorkerRequest) -> Result<WorkerResponse> {
    let request = forward_request(request, app)?;
    state
        .pool()
        .fetch(&app.dir, app.config.clone(), request)
        .await
}

/// Rewrite the URL relative to the app base and tell the worker where the
/// app is mounted.
fn forward_request(mut request: WorkerRequest, app: &AppInfo) -> Result<WorkerRequest> {
    let uri = relative_uri(request.uri(), &app.base_path)?;
    *request.uri_mut() = uri;

    let base = if app.base_path.is_empty() {
        "/"
    } else {
        app.base_path.as_str()
    };
    let value = HeaderValue::from_str(base)
        .map_err(|_| Error::validation(format!("invalid base path '{}'", base)))?;
    request.headers_mut().insert(BASE_HEADER, value);
    Ok(request)
}

fn relative_uri(uri: &Uri, base: &str) -> Result<Uri> {
    let path = uri.path();
    let rest = path.strip_prefix(base).unwrap_or(path);
    let rest = if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    };

    let target = match uri.query() {
        Some(query) => format!("{}?{}", rest, query),
        None => rest,
    };
    target
        .parse()
        .map_err(|e| Error::validation(format!("invalid request path: {}", e)))
}

fn under_base(path: &str, base: &str) -> bool {
    base == "/"
        || path == base
        || path
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn clone_request(request: &WorkerRequest) -> WorkerRequest {
    let mut copy = http::Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

async fn buffer(response: Response, limit: usize) -> Result<WorkerResponse> {
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| Error::validation(format!("failed to read plugin response: {}", e)))?;
    Ok(WorkerResponse::from_parts(parts, bytes))
}

fn buffered_error(status: StatusCode, code: &str, message: &str) -> WorkerResponse {
    let body = serde_json::json!({
        "error": {
            "code": code,
            "message": message,
        }
    });
    let mut response = http::Response::new(Bytes::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn into_axum(response: WorkerResponse) -> Response {
    let (mut parts, body) = response.into_parts();
    // hooks may have changed the body
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(body))
}

/// JSON body for failures that escape a handler as a panic.
pub fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("Handler panicked: {}", message);
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "Internal server error",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    #[test]
    fn test_relative_uri_keeps_query() {
        let uri: Uri = "/todo@1.0.0/items?page=2".parse().unwrap();
        assert_eq!(relative_uri(&uri, "/todo@1.0.0").unwrap(), "/items?page=2");

        let uri: Uri = "/todo".parse().unwrap();
        assert_eq!(relative_uri(&uri, "/todo").unwrap(), "/");

        let uri: Uri = "/anything".parse().unwrap();
        assert_eq!(relative_uri(&uri, "").unwrap(), "/anything");
    }

    #[test]
    fn test_under_base() {
        assert!(under_base("/metrics", "/metrics"));
        assert!(under_base("/metrics/x", "/metrics"));
        assert!(!under_base("/metricsx", "/metrics"));
        assert!(under_base("/anything", "/"));
    }

    #[test]
    fn test_clone_request() {
        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/a?b=1")
            .header("x-test", "1")
            .body(Bytes::from_static(b"body"))
            .unwrap();
        let copy = clone_request(&request);
        assert_eq!(copy.method(), &Method::POST);
        assert_eq!(copy.uri().to_string(), "/a?b=1");
        assert_eq!(copy.headers()["x-test"], "1");
        assert_eq!(copy.body(), &Bytes::from_static(b"body"));
    }
}
