//! Server Configuration
//!
//! `RuntimeConfig` is layered with figment: built-in defaults, then an
//! optional `runway.toml`, then `RUNWAY_*` environment variables. The binary
//! applies CLI flags on top.

pub mod worker;

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use worker::{ConfigCache, WorkerConfig, WorkerConfigPatch, WorkerKey};

/// Prefix of the internal API. Requests under it never reach plugins or apps.
pub const API_PREFIX: &str = "/api";

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "runway.toml";

/// Process-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    /// Ordered search roots for apps; the first one receives deployments.
    pub apps_dirs: Vec<PathBuf>,
    pub body_limit_bytes: usize,
    pub pool: PoolSettings,
    pub worker: WorkerSettings,
    /// Built-in plugins to enable, in registration order.
    pub plugins: Vec<PluginEntry>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9700,
            apps_dirs: vec![PathBuf::from("./apps")],
            body_limit_bytes: 50 * 1024 * 1024,
            pool: PoolSettings::default(),
            worker: WorkerSettings::default(),
            plugins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub sweep_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Memory pressure starts when the available fraction drops below this.
    pub memory_pressure_threshold: f64,
    /// Upper bound on live workers; 0 means unbounded.
    pub max_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 10_000,
            shutdown_grace_ms: 5_000,
            memory_pressure_threshold: 0.1,
            max_size: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Command prefix for script entrypoints, e.g. `["bun", "run"]`.
    pub launcher: Vec<String>,
    pub install_command: Vec<String>,
    pub startup_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            launcher: vec!["bun".to_string(), "run".to_string()],
            install_command: vec!["bun".to_string(), "install".to_string()],
            startup_timeout_ms: 10_000,
        }
    }
}

/// One enabled plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl RuntimeConfig {
    /// Load configuration from defaults, a TOML file and the environment.
    ///
    /// An explicit `path` must exist; without one, `runway.toml` is read
    /// only when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(RuntimeConfig::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(crate::Error::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        }

        let config: RuntimeConfig = figment
            .merge(Env::prefixed("RUNWAY_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.apps_dirs.is_empty() {
            return Err(crate::Error::Config("apps_dirs must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.pool.memory_pressure_threshold) {
            return Err(crate::Error::Config(
                "pool.memory_pressure_threshold must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }

    /// Directory deployments are written to.
    pub fn deploy_root(&self) -> &Path {
        &self.apps_dirs[0]
    }
}
