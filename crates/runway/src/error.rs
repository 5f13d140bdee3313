//! Error types shared by the runtime core.

use std::path::PathBuf;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use runway_worker::WorkerError;
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("Plugin '{plugin}' depends on '{dependency}', which is not registered yet")]
    MissingDependency { plugin: String, dependency: String },

    #[error("Path '{path}' is reserved by plugin '{plugin}'")]
    RouteConflict { path: String, plugin: String },

    #[error("Failed to create worker for {}: {source}", .dir.display())]
    WorkerCreation {
        dir: PathBuf,
        #[source]
        source: WorkerError,
    },

    #[error("Plugin '{plugin}' failed in {hook}: {message}")]
    Hook {
        plugin: String,
        hook: &'static str,
        message: String,
    },

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::DuplicatePlugin(_) => "DUPLICATE_PLUGIN",
            Error::MissingDependency { .. } => "MISSING_DEPENDENCY",
            Error::RouteConflict { .. } => "ROUTE_CONFLICT",
            Error::WorkerCreation { .. } => "WORKER_CREATION_ERROR",
            Error::Hook { .. } => "HOOK_ERROR",
            Error::Worker(WorkerError::Terminated) => "WORKER_TERMINATED",
            Error::Worker(WorkerError::Timeout(_)) => "WORKER_TIMEOUT",
            Error::Worker(_) => "WORKER_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "INVALID_JSON",
            Error::Config(_) => "CONFIG_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RouteConflict { .. } => StatusCode::CONFLICT,
            Error::Worker(WorkerError::Terminated) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Worker(WorkerError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Error::Worker(WorkerError::App(_)) => StatusCode::BAD_GATEWAY,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A request failing with this error may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Worker(e) if e.is_retryable())
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Build the JSON error body every surface of the server returns.
pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = json!({
        "error": {
            "code": code,
            "message": message.into(),
        }
    });
    (status, Json(body)).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        // Internal details stay in the log for IO failures.
        let message = match &self {
            Error::Io(_) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let mut response = error_response(status, self.code(), message);
        if self.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
