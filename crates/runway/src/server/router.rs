//! HTTP Router
//!
//! `/api` is served directly; every other path goes through the dispatcher.

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::Response;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use super::api;
use super::handler::{dispatch, panic_response};
use super::state::AppState;
use crate::config::API_PREFIX;
use crate::error::error_response;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config().body_limit_bytes;

    Router::new()
        .nest(API_PREFIX, api::router().fallback(api_not_found))
        // Plugins and apps
        .fallback(dispatch)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

async fn api_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Unknown API endpoint")
}
