//! Runway Worker
//!
//! Isolated execution contexts for deployed apps. Each worker runs in its
//! own OS thread with a current-thread tokio runtime and a `LocalSet`, so
//! app runtimes never need to be `Send`.
//!
//! # Architecture
//!
//! - `spawn_worker` starts the thread and waits until the app runtime is ready
//! - `WorkerHandle` is the host side: `fetch`, `terminate`, `join`
//! - Inside the thread an [`AppRuntime`] answers requests; every fetch runs
//!   as its own local task so overlapping requests interleave
//! - Communication with the host is just: fetch request -> response

mod command;
mod error;
mod handle;
mod spawn;
mod worker;

pub mod base_href;
pub mod runtime;

pub use error::WorkerError;
pub use handle::WorkerHandle;
pub use runtime::{AppRuntime, ProcessRuntime, StaticRuntime};
pub use spawn::spawn_worker;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;

/// Request as seen by a worker (fully buffered body).
pub type WorkerRequest = http::Request<Bytes>;

/// Response produced by a worker (fully buffered body).
pub type WorkerResponse = http::Response<Bytes>;

/// Header carrying the absolute mount path of the app.
pub const BASE_HEADER: &str = "x-base";

/// Everything a worker thread needs to boot one app version.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Thread name, used in logs.
    pub name: String,
    /// Absolute app version directory.
    pub dir: PathBuf,
    /// Entrypoint relative to `dir`.
    pub entrypoint: Option<String>,
    /// Extra environment for process-backed apps.
    pub env: BTreeMap<String, String>,
    /// Per-request timeout; zero disables it.
    pub timeout: Duration,
    /// Command prefix used to run non-html entrypoints (e.g. `bun run`).
    pub launcher: Vec<String>,
    /// Install dependencies before starting a process-backed app.
    pub auto_install: bool,
    /// Command used when `auto_install` applies.
    pub install_command: Vec<String>,
    /// How long a process-backed app may take to accept connections.
    pub startup_timeout: Duration,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            entrypoint: None,
            env: BTreeMap::new(),
            timeout: Duration::from_secs(30),
            launcher: Vec::new(),
            auto_install: false,
            install_command: Vec::new(),
            startup_timeout: Duration::from_secs(10),
        }
    }
}
