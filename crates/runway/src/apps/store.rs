//! Deployment storage.
//!
//! All file mutations of deployed apps go through [`AppStore`]. Each
//! directory carries a `.dirinfo` summary that is recomputed when stale and
//! persisted by a background writer task.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::path::{classify, is_valid_upload_destination};
use super::version::{scan_root, AppVersion};
use crate::error::{Error, Result};
use crate::plugin::ReservedPaths;

/// Name of the per-directory summary file. Never listed.
pub const DIRINFO_FILE: &str = ".dirinfo";

/// Summary of a directory subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirInfo {
    pub files: u64,
    pub size: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    /// Path relative to the deploy root.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<DirInfo>,
}

struct PendingWrite {
    dir: PathBuf,
    info: DirInfo,
    generation: u64,
}

pub struct AppStore {
    roots: Vec<PathBuf>,
    reserved: ReservedPaths,
    /// Bumped by every mutation; queued summaries from older generations
    /// are dropped.
    generation: Arc<AtomicU64>,
    writer: mpsc::UnboundedSender<PendingWrite>,
}

impl AppStore {
    /// Create a store over `roots` (the first one receives deployments).
    ///
    /// Must be called inside a tokio runtime: it spawns the `.dirinfo`
    /// writer, which stops once the store is dropped.
    pub fn new(roots: Vec<PathBuf>, reserved: ReservedPaths) -> Self {
        let (writer, rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_dirinfo_writer(rx, generation.clone()));

        Self {
            roots,
            reserved,
            generation,
            writer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.roots[0]
    }

    pub fn reserved(&self) -> &ReservedPaths {
        &self.reserved
    }

    /// Map a client path onto the deploy root.
    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let mut out = self.root().to_path_buf();
        for segment in rel.split('/').filter(|s| !s.is_empty()) {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(part)), None) if !segment.contains('\\') => {
                    out.push(part)
                }
                _ => {
                    return Err(Error::validation(format!(
                        "invalid path segment '{}' in '{}'",
                        segment, rel
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Reject mutations outside a version directory or into an app whose
    /// name a plugin has reserved.
    fn check_destination(&self, rel: &str) -> Result<()> {
        if !is_valid_upload_destination(rel) {
            return Err(Error::validation(format!(
                "'{}' is not inside an app version directory",
                rel
            )));
        }
        if let Some(name) = classify(rel).app_name {
            self.reserved.check(&format!("/{}", name))?;
        }
        Ok(())
    }

    pub async fn write_file(&self, rel: &str, contents: Bytes) -> Result<()> {
        let parent = parent_of(rel);
        self.check_destination(parent)?;
        let path = self.resolve(rel)?;
        if path == self.resolve(parent)? {
            return Err(Error::validation("file path must name a file"));
        }

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.invalidate(&path).await;
        tokio::fs::write(&path, &contents).await?;

        info!("Wrote {} ({} bytes)", path.display(), contents.len());
        Ok(())
    }

    pub async fn read_file(&self, rel: &str) -> Result<Bytes> {
        let path = self.resolve(rel)?;
        Ok(Bytes::from(tokio::fs::read(&path).await?))
    }

    pub async fn is_dir(&self, rel: &str) -> Result<bool> {
        let path = self.resolve(rel)?;
        Ok(tokio::fs::metadata(&path).await?.is_dir())
    }

    pub async fn mkdir(&self, rel: &str) -> Result<()> {
        self.check_destination(rel)?;
        let path = self.resolve(rel)?;
        tokio::fs::create_dir_all(&path).await?;
        self.invalidate(&path).await;
        debug!("Created {}", path.display());
        Ok(())
    }

    pub async fn delete(&self, rel: &str) -> Result<()> {
        if !is_valid_upload_destination(rel) {
            return Err(Error::validation(format!(
                "'{}' is not inside an app version directory",
                rel
            )));
        }
        let path = self.resolve(rel)?;
        let meta = tokio::fs::metadata(&path).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        self.invalidate(&path).await;
        info!("Deleted {}", path.display());
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        if !is_valid_upload_destination(from) {
            return Err(Error::validation(format!(
                "'{}' is not inside an app version directory",
                from
            )));
        }
        self.check_destination(to)?;

        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if tokio::fs::try_exists(&target).await? {
            return Err(Error::validation(format!("'{}' already exists", to)));
        }
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        tokio::fs::rename(&source, &target).await?;
        self.invalidate(&source).await;
        self.invalidate(&target).await;
        info!("Moved {} -> {}", source.display(), target.display());
        Ok(())
    }

    /// Entries of a directory under the deploy root, `.dirinfo` excluded.
    pub async fn list(&self, rel: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve(rel)?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut out = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == DIRINFO_FILE {
                continue;
            }
            let meta = entry.metadata().await?;
            let info = if meta.is_dir() {
                Some(self.dir_info(&entry.path()).await?)
            } else {
                None
            };

            out.push(DirEntry {
                path: join_rel(rel, &name),
                name,
                is_dir: meta.is_dir(),
                size: info.as_ref().map(|i| i.size).unwrap_or(meta.len()),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                info,
            });
        }

        out.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    /// Cached summary of `dir`, recomputed when a direct child is newer.
    pub async fn dir_info(&self, dir: &Path) -> Result<DirInfo> {
        if let Some(cached) = read_cached(dir).await {
            if !is_stale(dir, &cached).await? {
                return Ok(cached);
            }
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let info = compute_dir_info(dir).await?;
        let _ = self.writer.send(PendingWrite {
            dir: dir.to_path_buf(),
            info: info.clone(),
            generation,
        });
        Ok(info)
    }

    /// Every deployed app with its versions, across all roots.
    pub async fn apps(&self) -> Result<BTreeMap<String, Vec<AppVersion>>> {
        let mut apps: BTreeMap<String, Vec<AppVersion>> = BTreeMap::new();
        for (index, root) in self.roots.iter().enumerate() {
            for version in scan_root(root, index).await? {
                apps.entry(version.name.clone()).or_default().push(version);
            }
        }
        Ok(apps)
    }

    /// Drop the summaries of `path` and every ancestor inside the root.
    async fn invalidate(&self, path: &Path) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let root = self.root();
        let mut current = Some(path);
        while let Some(dir) = current {
            if !dir.starts_with(root) {
                break;
            }
            match tokio::fs::remove_file(dir.join(DIRINFO_FILE)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => {}
                Err(e) => warn!("Failed to invalidate {}: {}", dir.display(), e),
            }
            current = dir.parent();
        }
    }
}

fn parent_of(rel: &str) -> &str {
    let trimmed = rel.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}

fn join_rel(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

async fn read_cached(dir: &Path) -> Option<DirInfo> {
    let text = tokio::fs::read_to_string(dir.join(DIRINFO_FILE)).await.ok()?;
    serde_json::from_str(&text).ok()
}

async fn is_stale(dir: &Path, cached: &DirInfo) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() == DIRINFO_FILE {
            continue;
        }
        if let Ok(modified) = entry.metadata().await?.modified() {
            if DateTime::<Utc>::from(modified) > cached.updated_at {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn compute_dir_info(dir: &Path) -> Result<DirInfo> {
    let mut files = 0;
    let mut size = 0;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == DIRINFO_FILE {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                files += 1;
                size += meta.len();
            }
        }
    }

    Ok(DirInfo {
        files,
        size,
        updated_at: Utc::now(),
    })
}

async fn run_dirinfo_writer(
    mut rx: mpsc::UnboundedReceiver<PendingWrite>,
    generation: Arc<AtomicU64>,
) {
    while let Some(pending) = rx.recv().await {
        if pending.generation != generation.load(Ordering::SeqCst) {
            continue;
        }
        let json = match serde_json::to_vec(&pending.info) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode dirinfo: {}", e);
                continue;
            }
        };
        if let Err(e) = tokio::fs::write(pending.dir.join(DIRINFO_FILE), json).await {
            warn!(
                "Failed to write dirinfo for {}: {}",
                pending.dir.display(),
                e
            );
        }
    }
    debug!("Dirinfo writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn store(dir: &TempDir) -> AppStore {
        AppStore::new(vec![dir.path().to_path_buf()], ReservedPaths::new())
    }

    #[tokio::test]
    async fn test_write_requires_version_dir() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert_ok!(
            store
                .write_file("todo@1.0.0/index.html", Bytes::from_static(b"<html></html>"))
                .await
        );
        assert_ok!(
            store
                .write_file("todo/2.0.0/src/app.js", Bytes::from_static(b"1"))
                .await
        );
        assert!(dir.path().join("todo/2.0.0/src/app.js").exists());

        let err = store
            .write_file("todo/index.html", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_err!(store.write_file("index.html", Bytes::new()).await);
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = store
            .write_file("todo@1.0.0/../../etc/passwd", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_reserved_app_name_conflicts() {
        let dir = TempDir::new().unwrap();
        let mut reserved = ReservedPaths::new();
        reserved.insert("/todo", "todo-plugin");
        let store = AppStore::new(vec![dir.path().to_path_buf()], reserved);

        let err = store
            .write_file("todo@1.0.0/index.html", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RouteConflict { .. }));
        assert_err!(store.mkdir("todo/1.0.0").await);
    }

    #[tokio::test]
    async fn test_delete_and_rename() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .write_file("app@1.0.0/a.txt", Bytes::from_static(b"a"))
            .await
            .unwrap();

        assert_ok!(store.rename("app@1.0.0/a.txt", "app@1.0.0/b.txt").await);
        assert!(dir.path().join("app@1.0.0/b.txt").exists());

        // app roots cannot be removed wholesale
        std::fs::create_dir_all(dir.path().join("nested/1.0.0")).unwrap();
        assert_err!(store.delete("nested").await);

        assert_ok!(store.delete("app@1.0.0").await);
        assert!(!dir.path().join("app@1.0.0").exists());
    }

    #[tokio::test]
    async fn test_list_hides_dirinfo_and_summarizes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .write_file("app@1.0.0/a.txt", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        store
            .write_file("app@1.0.0/sub/b.txt", Bytes::from_static(b"de"))
            .await
            .unwrap();

        let entries = store.list("").await.unwrap();
        assert_eq!(entries.len(), 1);
        let info = entries[0].info.clone().unwrap();
        assert_eq!(info.files, 2);
        assert_eq!(info.size, 5);

        // let the writer persist the summary
        for _ in 0..50 {
            if dir.path().join("app@1.0.0").join(DIRINFO_FILE).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let listing = store.list("app@1.0.0").await.unwrap();
        assert!(listing.iter().all(|e| e.name != DIRINFO_FILE));
        assert_eq!(listing[0].name, "sub");

        // a write deep inside invalidates the ancestors
        store
            .write_file("app@1.0.0/sub/c.txt", Bytes::from_static(b"f"))
            .await
            .unwrap();
        let info = store.dir_info(&dir.path().join("app@1.0.0")).await.unwrap();
        assert_eq!(info.files, 3);
    }

    #[tokio::test]
    async fn test_apps_groups_versions() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.mkdir("todo@1.0.0").await.unwrap();
        store.mkdir("todo/2.0.0").await.unwrap();
        store.mkdir("notes/latest").await.unwrap();

        let apps = store.apps().await.unwrap();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps["todo"].len(), 2);
        assert_eq!(apps["notes"][0].version, "latest");
    }
}
