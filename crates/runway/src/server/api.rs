//! Internal API
//!
//! Health, metrics and deployment management, mounted under `/api`.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::state::AppState;
use crate::apps::{AppVersion, DirEntry};
use crate::error::Result;
use crate::plugin::PluginSummary;
use crate::pool::PoolMetrics;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/plugins", get(plugins))
        .route("/apps", get(apps))
        .route("/files", get(read_files).put(write_file).delete(delete_file))
        .route("/files/mkdir", post(mkdir))
        .route("/files/move", post(move_file))
        .route("/workers", delete(evict_workers))
}

/// Health check response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_ms: u64,
    workers: usize,
    plugins: usize,
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_ms: state.uptime().as_millis() as u64,
        workers: state.pool().len(),
        plugins: state.registry().len(),
    })
}

async fn metrics(State(state): State<AppState>) -> Json<PoolMetrics> {
    Json(state.pool().metrics())
}

async fn plugins(State(state): State<AppState>) -> Json<Vec<PluginSummary>> {
    Json(state.registry().describe())
}

async fn apps(State(state): State<AppState>) -> Result<Json<BTreeMap<String, Vec<AppVersion>>>> {
    Ok(Json(state.store().apps().await?))
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

#[derive(Serialize)]
struct Listing {
    path: String,
    entries: Vec<DirEntry>,
}

/// Directory listing as JSON, file contents as raw bytes.
async fn read_files(State(state): State<AppState>, Query(query): Query<PathQuery>) -> Result<Response> {
    let store = state.store();
    if store.is_dir(&query.path).await? {
        let entries = store.list(&query.path).await?;
        return Ok(Json(Listing {
            path: query.path,
            entries,
        })
        .into_response());
    }

    let contents = store.read_file(&query.path).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], contents).into_response())
}

async fn write_file(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    body: Bytes,
) -> Result<StatusCode> {
    state.store().write_file(&query.path, body).await?;
    Ok(StatusCode::CREATED)
}

async fn delete_file(State(state): State<AppState>, Query(query): Query<PathQuery>) -> Result<StatusCode> {
    state.store().delete(&query.path).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct MkdirRequest {
    path: String,
}

async fn mkdir(State(state): State<AppState>, Json(req): Json<MkdirRequest>) -> Result<StatusCode> {
    state.store().mkdir(&req.path).await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    from: String,
    to: String,
}

async fn move_file(State(state): State<AppState>, Json(req): Json<MoveRequest>) -> Result<StatusCode> {
    state.store().rename(&req.from, &req.to).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct EvictResponse {
    evicted: usize,
}

async fn evict_workers(State(state): State<AppState>) -> Json<EvictResponse> {
    Json(EvictResponse {
        evicted: state.pool().evict_all(),
    })
}
