//! Error types for worker execution contexts.

use std::time::Duration;

/// Errors that can occur while creating or talking to a worker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker has terminated")]
    Terminated,

    #[error("Worker did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Worker thread panicked")]
    ThreadPanic,

    #[error("Failed to start worker: {0}")]
    Startup(String),

    #[error("App error: {0}")]
    App(String),
}

impl WorkerError {
    /// Whether the request may succeed if sent again (to a fresh worker).
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::Terminated)
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        WorkerError::Startup(err.to_string())
    }
}
