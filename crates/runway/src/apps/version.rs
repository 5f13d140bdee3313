//! App address parsing and version resolution.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use semver::{Version, VersionReq};
use serde::Serialize;

use super::Layout;
use crate::error::{Error, Result};

/// Folder name that marks the explicitly promoted version.
pub const LATEST_TAG: &str = "latest";

/// `name`, `name@spec` or `name/spec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppAddress {
    pub name: String,
    pub version_spec: Option<String>,
}

impl AppAddress {
    pub fn parse(identifier: &str) -> Result<Self> {
        let identifier = identifier.trim().trim_matches('/');

        let (name, spec) = match identifier.rfind('@') {
            Some(idx) if idx > 0 => (&identifier[..idx], Some(&identifier[idx + 1..])),
            _ => match identifier.split_once('/') {
                Some((name, spec)) => (name, Some(spec)),
                None => (identifier, None),
            },
        };

        if name.is_empty() || name.contains('/') {
            return Err(Error::validation(format!(
                "invalid app identifier '{}'",
                identifier
            )));
        }

        Ok(Self {
            name: name.to_string(),
            version_spec: spec
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }
}

impl fmt::Display for AppAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version_spec {
            Some(spec) => write!(f, "{}@{}", self.name, spec),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A parsed version spec.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionSpec {
    Latest,
    Exact(Version),
    Range(VersionReq),
}

impl VersionSpec {
    /// Partials widen to wildcards: `1` is `1.*`, `1.4` is `1.4.*`.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec == LATEST_TAG {
            return Ok(VersionSpec::Latest);
        }
        if let Ok(version) = Version::parse(spec) {
            return Ok(VersionSpec::Exact(version));
        }

        let is_partial = !spec.is_empty()
            && spec.split('.').count() <= 2
            && spec.split('.').all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
        let req = if is_partial {
            format!("{}.*", spec)
        } else {
            spec.to_string()
        };

        VersionReq::parse(&req)
            .map(VersionSpec::Range)
            .map_err(|e| Error::validation(format!("invalid version spec '{}': {}", spec, e)))
    }
}

/// The version a folder stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderVersion {
    Latest,
    Numeric(Version),
}

impl FolderVersion {
    pub fn parse(segment: &str) -> Option<Self> {
        if segment == LATEST_TAG {
            return Some(FolderVersion::Latest);
        }
        Version::parse(segment).ok().map(FolderVersion::Numeric)
    }
}

impl fmt::Display for FolderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FolderVersion::Latest => f.write_str(LATEST_TAG),
            FolderVersion::Numeric(v) => write!(f, "{}", v),
        }
    }
}

/// True when `segment` names a version folder.
pub fn is_version_segment(segment: &str) -> bool {
    FolderVersion::parse(segment).is_some()
}

/// One version folder of an app found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct AppVersion {
    pub name: String,
    pub version: String,
    pub layout: Layout,
    pub dir: PathBuf,
    #[serde(skip)]
    pub root_index: usize,
    #[serde(skip)]
    folder: Option<FolderVersion>,
}

impl AppVersion {
    fn folder_version(&self) -> Option<&FolderVersion> {
        self.folder.as_ref()
    }

    fn numeric(&self) -> Option<&Version> {
        match self.folder_version() {
            Some(FolderVersion::Numeric(v)) => Some(v),
            _ => None,
        }
    }

    fn is_latest(&self) -> bool {
        matches!(self.folder_version(), Some(FolderVersion::Latest))
    }

    /// Location rank when two folders hold the same version: flat before
    /// nested, then earlier roots first. Lower wins.
    fn location_rank(&self) -> (Layout, usize) {
        (self.layout, self.root_index)
    }
}

/// Maps app identifiers to version directories across several roots.
#[derive(Debug, Clone)]
pub struct VersionResolver {
    roots: Vec<PathBuf>,
}

impl VersionResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolve `identifier` to an app version directory.
    pub async fn resolve(&self, identifier: &str) -> Result<AppVersion> {
        let address = AppAddress::parse(identifier)?;
        let spec = address
            .version_spec
            .as_deref()
            .map(VersionSpec::parse)
            .transpose()?;

        let candidates = self.versions(&address.name).await?;
        select(candidates, spec.as_ref())
            .ok_or_else(|| Error::not_found(format!("app '{}'", address)))
    }

    /// True when at least one version of `name` exists under any root.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(!self.versions(name).await?.is_empty())
    }

    /// Every valid version folder of `name`, across roots and layouts.
    pub async fn versions(&self, name: &str) -> Result<Vec<AppVersion>> {
        let mut out = Vec::new();
        for (index, root) in self.roots.iter().enumerate() {
            out.extend(
                scan_root(root, index)
                    .await?
                    .into_iter()
                    .filter(|v| v.name == name),
            );
        }
        Ok(out)
    }

    /// Every app version under every root.
    pub async fn all(&self) -> Result<Vec<AppVersion>> {
        let mut out = Vec::new();
        for (index, root) in self.roots.iter().enumerate() {
            out.extend(scan_root(root, index).await?);
        }
        Ok(out)
    }
}

/// Enumerate version folders of every app directly under `root`.
pub(crate) async fn scan_root(root: &Path, root_index: usize) -> Result<Vec<AppVersion>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };

        if let Some(idx) = file_name.rfind('@').filter(|idx| *idx > 0) {
            if let Some(folder) = FolderVersion::parse(&file_name[idx + 1..]) {
                out.push(AppVersion {
                    name: file_name[..idx].to_string(),
                    version: folder.to_string(),
                    layout: Layout::Flat,
                    dir: entry.path(),
                    root_index,
                    folder: Some(folder),
                });
            }
            continue;
        }

        let mut children = tokio::fs::read_dir(entry.path()).await?;
        while let Some(child) = children.next_entry().await? {
            if !child.file_type().await?.is_dir() {
                continue;
            }
            let Some(folder) = child.file_name().to_str().and_then(FolderVersion::parse) else {
                continue;
            };
            out.push(AppVersion {
                name: file_name.clone(),
                version: folder.to_string(),
                layout: Layout::Nested,
                dir: child.path(),
                root_index,
                folder: Some(folder),
            });
        }
    }

    Ok(out)
}

/// Pick the winning candidate for `spec`.
///
/// Without a spec, or with `latest`, a `latest` folder wins; when there is
/// none the highest numeric version is used.
fn select(candidates: Vec<AppVersion>, spec: Option<&VersionSpec>) -> Option<AppVersion> {
    let prefer_latest = matches!(spec, None | Some(VersionSpec::Latest));
    if prefer_latest {
        let latest = candidates
            .iter()
            .filter(|c| c.is_latest())
            .min_by(|a, b| a.location_rank().cmp(&b.location_rank()));
        if let Some(latest) = latest {
            return Some(latest.clone());
        }
    }

    candidates
        .into_iter()
        .filter(|c| match (c.numeric(), spec) {
            (None, _) => false,
            (Some(_), None | Some(VersionSpec::Latest)) => true,
            (Some(v), Some(VersionSpec::Exact(exact))) => v == exact,
            (Some(v), Some(VersionSpec::Range(req))) => req.matches(v),
        })
        .max_by(|a, b| compare(a, b))
}

fn compare(a: &AppVersion, b: &AppVersion) -> Ordering {
    a.numeric()
        .cmp(&b.numeric())
        // reversed so the better location is the "greater" one for max_by
        .then_with(|| b.location_rank().cmp(&a.location_rank()))
}
