//! Worker creation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runway_worker::{spawn_worker, WorkerError, WorkerHandle, WorkerRequest, WorkerResponse, WorkerSpec};
use tracing::warn;

use super::instance::AppWorker;
use crate::config::{WorkerConfig, WorkerSettings};

/// Creates the execution context for one app directory and config.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn create(
        &self,
        dir: &Path,
        config: &WorkerConfig,
    ) -> Result<Arc<dyn AppWorker>, WorkerError>;
}

/// Spawns one `runway-worker` thread per worker.
pub struct ThreadWorkerFactory {
    settings: WorkerSettings,
}

impl ThreadWorkerFactory {
    pub fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }

    fn spec(&self, dir: &Path, config: &WorkerConfig) -> WorkerSpec {
        let mut spec = WorkerSpec::new(worker_name(dir), dir);
        spec.entrypoint = config.entrypoint.clone();
        spec.env = config.env.clone();
        spec.timeout = config.timeout();
        spec.auto_install = config.auto_install;
        spec.launcher = self.settings.launcher.clone();
        spec.install_command = self.settings.install_command.clone();
        spec.startup_timeout = Duration::from_millis(self.settings.startup_timeout_ms);
        spec
    }
}

#[async_trait]
impl WorkerFactory for ThreadWorkerFactory {
    async fn create(
        &self,
        dir: &Path,
        config: &WorkerConfig,
    ) -> Result<Arc<dyn AppWorker>, WorkerError> {
        let handle = spawn_worker(self.spec(dir, config)).await?;
        Ok(Arc::new(ThreadWorker(Arc::new(handle))))
    }
}

/// `name@version` for both layouts, used as the worker thread name.
fn worker_name(dir: &Path) -> String {
    let last = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "app".to_string());
    if last.contains('@') {
        return last;
    }
    match dir.parent().and_then(Path::file_name) {
        Some(parent) => format!("{}@{}", parent.to_string_lossy(), last),
        None => last,
    }
}

struct ThreadWorker(Arc<WorkerHandle>);

#[async_trait]
impl AppWorker for ThreadWorker {
    fn id(&self) -> u64 {
        self.0.id()
    }

    async fn fetch(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        self.0.fetch(request).await
    }

    async fn shutdown(&self) {
        self.0.terminate();
        let handle = self.0.clone();
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Worker {} exited with error: {}", self.0.name(), e),
            Err(e) => warn!("Failed to join worker {}: {}", self.0.name(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_name() {
        assert_eq!(worker_name(Path::new("/apps/todo@1.0.0")), "todo@1.0.0");
        assert_eq!(worker_name(Path::new("/apps/todo/2.0.0")), "todo@2.0.0");
    }

    #[test]
    fn test_spec_carries_config() {
        let factory = ThreadWorkerFactory::new(WorkerSettings::default());
        let config = WorkerConfig {
            timeout_ms: 1500,
            auto_install: true,
            ..WorkerConfig::default()
        };
        let spec = factory.spec(Path::new("/apps/todo@1.0.0"), &config);
        assert_eq!(spec.timeout, Duration::from_millis(1500));
        assert!(spec.auto_install);
        assert_eq!(spec.launcher, vec!["bun".to_string(), "run".to_string()]);
    }
}
