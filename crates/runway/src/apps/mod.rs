//! Deployed apps
//!
//! Two on-disk layouts are supported under every apps root:
//!
//! - flat: `root/name@1.2.0/...`
//! - nested: `root/name/1.2.0/...`
//!
//! A version folder may also be named `latest`.

pub mod path;
pub mod store;
pub mod version;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::WorkerConfig;
use crate::routes::RouteMatcher;

pub use path::{classify, is_valid_upload_destination, PathInfo};
pub use store::{AppStore, DirEntry, DirInfo};
pub use version::{AppAddress, AppVersion, VersionResolver, VersionSpec, LATEST_TAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Flat,
    Nested,
}

/// Who serves a resolved app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppOwner {
    /// Declared by a plugin under its `apps`.
    Plugin(String),
    /// Deployed under an apps root and addressed by name.
    Deployed,
}

/// Target app of a request, handed to request and response hooks.
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub name: String,
    pub owner: AppOwner,
    /// Absolute app version directory.
    pub dir: PathBuf,
    /// Absolute mount path, without trailing slash.
    pub base_path: String,
    pub config: Arc<WorkerConfig>,
    /// The app's `publicRoutes`, anchored at `base_path`.
    pub public_routes: Arc<RouteMatcher>,
}
