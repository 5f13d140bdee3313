//! Per-app worker configuration.
//!
//! Read from `worker.jsonc`, `worker.json` or the `workerConfig` key of
//! `package.json` (first one found wins), then merged with any override a
//! plugin declares for its app.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::routes::PublicRoutes;

/// Config files probed in every app directory, in priority order.
pub const CONFIG_FILES: [&str; 3] = ["worker.jsonc", "worker.json", "package.json"];

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_REQUESTS: u64 = 1000;

/// Effective configuration of one worker.
///
/// Its serialized form is part of the [`WorkerKey`], so two requests share a
/// worker only when every field matches.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    pub entrypoint: Option<String>,
    pub timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Maximum worker age; 0 disables it.
    pub ttl_ms: u64,
    pub max_requests: u64,
    pub low_memory: bool,
    pub auto_install: bool,
    pub public_routes: PublicRoutes,
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            entrypoint: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            ttl_ms: 0,
            max_requests: DEFAULT_MAX_REQUESTS,
            low_memory: false,
            auto_install: false,
            public_routes: PublicRoutes::default(),
            env: BTreeMap::new(),
        }
    }
}

impl WorkerConfig {
    /// Apply defaults and validate a raw patch.
    pub fn from_patch(patch: &WorkerConfigPatch) -> Result<Self> {
        let defaults = WorkerConfig::default();

        let timeout_ms = match &patch.timeout {
            Some(value) => value.to_millis()?,
            None => defaults.timeout_ms,
        };
        let mut idle_timeout_ms = match &patch.idle_timeout {
            Some(value) => value.to_millis()?,
            None => defaults.idle_timeout_ms,
        };
        let ttl_ms = match &patch.ttl {
            Some(value) => value.to_millis()?,
            None => defaults.ttl_ms,
        };

        if ttl_ms > 0 && ttl_ms < timeout_ms {
            return Err(Error::validation(format!(
                "ttl ({}ms) must not be shorter than timeout ({}ms)",
                ttl_ms, timeout_ms
            )));
        }

        if idle_timeout_ms < timeout_ms {
            warn!(
                "idleTimeout ({}ms) is shorter than timeout ({}ms), raising it",
                idle_timeout_ms, timeout_ms
            );
            idle_timeout_ms = timeout_ms;
        }

        let max_requests = patch.max_requests.unwrap_or(defaults.max_requests);
        if max_requests == 0 {
            return Err(Error::validation("maxRequests must be at least 1"));
        }

        Ok(Self {
            entrypoint: patch.entrypoint.clone(),
            timeout_ms,
            idle_timeout_ms,
            ttl_ms,
            max_requests,
            low_memory: patch.low_memory.unwrap_or(defaults.low_memory),
            auto_install: patch.auto_install.unwrap_or(defaults.auto_install),
            public_routes: patch.public_routes.clone().unwrap_or_default(),
            env: patch.env.clone().unwrap_or_default(),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_ms > 0).then(|| Duration::from_millis(self.ttl_ms))
    }
}

/// A duration written either as seconds or as a unit-suffixed string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(f64),
    Text(String),
}

impl DurationValue {
    pub fn to_millis(&self) -> Result<u64> {
        match self {
            DurationValue::Seconds(secs) if *secs >= 0.0 && secs.is_finite() => {
                Ok((secs * 1000.0).round() as u64)
            }
            DurationValue::Seconds(secs) => {
                Err(Error::validation(format!("invalid duration {}", secs)))
            }
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}

/// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"2d"` or bare seconds.
pub fn parse_duration(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| Error::validation(format!("invalid duration '{}'", text)))?;

    let factor = match unit.trim() {
        "" | "s" => 1000.0,
        "ms" => 1.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        other => {
            return Err(Error::validation(format!(
                "unknown duration unit '{}' in '{}'",
                other, text
            )));
        }
    };

    Ok((value * factor).round() as u64)
}

/// Raw worker config as written on disk or declared by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<DurationValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<DurationValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_memory: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_install: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_routes: Option<PublicRoutes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

impl WorkerConfigPatch {
    /// Layer `other` on top of `self`. Env maps are combined.
    pub fn merge(mut self, other: &WorkerConfigPatch) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        take!(
            entrypoint,
            timeout,
            idle_timeout,
            ttl,
            max_requests,
            low_memory,
            auto_install,
            public_routes
        );

        if let Some(env) = &other.env {
            let merged = self.env.get_or_insert_with(BTreeMap::new);
            merged.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self
    }

    /// Read the patch stored in `dir`, or an empty one when there is none.
    pub async fn load(dir: &Path) -> Result<Self> {
        for name in CONFIG_FILES {
            let path = dir.join(name);
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            if name == "package.json" {
                let manifest: serde_json::Value = serde_json::from_str(&text)?;
                return match manifest.get("workerConfig") {
                    Some(value) => Ok(serde_json::from_value(value.clone())?),
                    None => Ok(Self::default()),
                };
            }

            let patch = serde_json::from_str(&strip_jsonc(&text)).map_err(|e| {
                Error::validation(format!("invalid {}: {}", path.display(), e))
            })?;
            debug!("Loaded worker config from {}", path.display());
            return Ok(patch);
        }

        Ok(Self::default())
    }
}

/// Remove `//` and `/* */` comments and trailing commas from JSONC text.
pub fn strip_jsonc(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }

    remove_trailing_commas(&out)
}

fn remove_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }

    out
}

/// Identity of a pooled worker: app directory plus serialized config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey {
    pub dir: PathBuf,
    pub config: String,
}

impl WorkerKey {
    pub fn new(dir: impl Into<PathBuf>, config: &WorkerConfig) -> Result<Self> {
        Ok(Self {
            dir: dir.into(),
            config: serde_json::to_string(config)?,
        })
    }
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir.display())
    }
}

type Fingerprint = Vec<Option<SystemTime>>;

struct CachedPatch {
    fingerprint: Fingerprint,
    patch: WorkerConfigPatch,
}

/// Loaded worker configs keyed by app directory.
///
/// An entry is reused until the mtime of any candidate config file changes
/// (including a file appearing or disappearing).
#[derive(Default)]
pub struct ConfigCache {
    entries: DashMap<PathBuf, CachedPatch>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective config for `dir`, with an optional plugin override on top.
    pub async fn resolve(
        &self,
        dir: &Path,
        overrides: Option<&WorkerConfigPatch>,
    ) -> Result<Arc<WorkerConfig>> {
        let mut patch = self.patch(dir).await?;
        if let Some(overrides) = overrides {
            patch = patch.merge(overrides);
        }
        Ok(Arc::new(WorkerConfig::from_patch(&patch)?))
    }

    async fn patch(&self, dir: &Path) -> Result<WorkerConfigPatch> {
        let fingerprint = fingerprint(dir).await;

        if let Some(cached) = self.entries.get(dir) {
            if cached.fingerprint == fingerprint {
                return Ok(cached.patch.clone());
            }
        }

        let patch = WorkerConfigPatch::load(dir).await?;
        self.entries.insert(
            dir.to_path_buf(),
            CachedPatch {
                fingerprint,
                patch: patch.clone(),
            },
        );
        Ok(patch)
    }

    pub fn invalidate(&self, dir: &Path) {
        self.entries.remove(dir);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

async fn fingerprint(dir: &Path) -> Fingerprint {
    let mut out = Vec::with_capacity(CONFIG_FILES.len());
    for name in CONFIG_FILES {
        let mtime = match tokio::fs::metadata(dir.join(name)).await {
            Ok(meta) => meta.modified().ok(),
            Err(_) => None,
        };
        out.push(mtime);
    }
    out
}
