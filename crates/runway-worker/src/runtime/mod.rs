//! App runtimes hosted inside a worker thread.
//!
//! A runtime is picked from the app directory when the worker boots:
//! html entrypoints are served as static files, anything else is run as a
//! child process and proxied.

mod process;
mod static_files;

pub use process::ProcessRuntime;
pub use static_files::StaticRuntime;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::{WorkerRequest, WorkerResponse, WorkerSpec};

/// Entrypoints probed, in order, when an app does not declare one.
const DEFAULT_ENTRYPOINTS: &[&str] = &[
    "index.html",
    "index.ts",
    "index.js",
    "index.mjs",
    "server.ts",
    "server.js",
];

/// An app living on a worker thread.
///
/// Runtimes are owned by a single thread and never cross it, so they are
/// not required to be `Send`.
#[async_trait(?Send)]
pub trait AppRuntime {
    /// Answer one request.
    async fn handle(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError>;

    /// Release resources before the thread exits.
    async fn shutdown(&self) {}
}

/// Pick and boot the runtime for `spec`.
pub(crate) async fn create(spec: &WorkerSpec) -> Result<Box<dyn AppRuntime>, WorkerError> {
    let entrypoint = match &spec.entrypoint {
        Some(entry) => entry.clone(),
        None => default_entrypoint(spec).await?,
    };

    if is_html(&entrypoint) {
        let runtime = StaticRuntime::new(&spec.dir, &entrypoint)?;
        tracing::debug!("[{}] Serving static files from {}", spec.name, spec.dir.display());
        Ok(Box::new(runtime))
    } else {
        let runtime = ProcessRuntime::start(spec, &entrypoint).await?;
        Ok(Box::new(runtime))
    }
}

async fn default_entrypoint(spec: &WorkerSpec) -> Result<String, WorkerError> {
    for candidate in DEFAULT_ENTRYPOINTS {
        if tokio::fs::metadata(spec.dir.join(candidate))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Ok((*candidate).to_string());
        }
    }
    Err(WorkerError::Startup(format!(
        "no entrypoint found in {}",
        spec.dir.display()
    )))
}

fn is_html(entrypoint: &str) -> bool {
    let lower = entrypoint.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".htm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_html() {
        assert!(is_html("index.html"));
        assert!(is_html("dist/App.HTM"));
        assert!(!is_html("index.ts"));
    }

    #[tokio::test]
    async fn test_default_entrypoint_prefers_html() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.ts"), "export default {}").unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();

        let spec = WorkerSpec::new("app", dir.path());
        assert_eq!(default_entrypoint(&spec).await.unwrap(), "index.html");
    }

    #[tokio::test]
    async fn test_missing_entrypoint_is_startup_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = WorkerSpec::new("app", dir.path());
        let err = default_entrypoint(&spec).await.unwrap_err();
        assert!(matches!(err, WorkerError::Startup(_)));
    }
}
