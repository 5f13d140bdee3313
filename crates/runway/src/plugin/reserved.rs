//! Paths reserved by plugins.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};

/// Path prefix -> owning plugin.
///
/// Every declared path is stored along with its first segment, so an app
/// named like a plugin prefix collides even when only the prefix overlaps.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ReservedPaths {
    paths: BTreeMap<String, String>,
}

impl ReservedPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `path` for `plugin`. The first plugin to claim a path keeps it.
    pub fn insert(&mut self, path: &str, plugin: &str) {
        let Some(path) = normalize(path) else {
            return;
        };

        if let Some(first) = first_segment(&path) {
            self.paths
                .entry(first)
                .or_insert_with(|| plugin.to_string());
        }
        self.paths.entry(path).or_insert_with(|| plugin.to_string());
    }

    /// Plugin owning `path` or its first segment.
    pub fn owner(&self, path: &str) -> Option<&str> {
        let path = normalize(path)?;
        if let Some(owner) = self.paths.get(&path) {
            return Some(owner);
        }
        first_segment(&path)
            .and_then(|first| self.paths.get(&first))
            .map(String::as_str)
    }

    /// Fail with `RouteConflict` when `path` collides with a reserved path.
    pub fn check(&self, path: &str) -> Result<()> {
        match self.owner(path) {
            Some(plugin) => Err(Error::RouteConflict {
                path: path.to_string(),
                plugin: plugin.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn for_plugin(&self, plugin: &str) -> Vec<String> {
        self.paths
            .iter()
            .filter(|(_, owner)| owner.as_str() == plugin)
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.paths.iter().map(|(p, o)| (p.as_str(), o.as_str()))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Leading slash, no glob tail, no trailing slash. The root is never reserved.
fn normalize(path: &str) -> Option<String> {
    let literal = match path.find(['*', '?', '[', '{']) {
        Some(idx) => &path[..idx],
        None => path,
    };
    let trimmed = literal.trim().trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(format!("/{}", trimmed))
}

fn first_segment(path: &str) -> Option<String> {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| format!("/{}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_segment_is_reserved() {
        let mut reserved = ReservedPaths::new();
        reserved.insert("/admin/api/**", "admin");

        assert_eq!(reserved.owner("/admin/api"), Some("admin"));
        assert_eq!(reserved.owner("/admin"), Some("admin"));
        assert_eq!(reserved.owner("admin/other"), Some("admin"));
        assert_eq!(reserved.owner("/todo"), None);
        assert_eq!(reserved.for_plugin("admin").len(), 2);
    }

    #[test]
    fn test_first_claim_wins() {
        let mut reserved = ReservedPaths::new();
        reserved.insert("/todo", "a");
        reserved.insert("/todo", "b");
        assert_eq!(reserved.owner("/todo"), Some("a"));
    }

    #[test]
    fn test_root_is_never_reserved() {
        let mut reserved = ReservedPaths::new();
        reserved.insert("/", "site");
        reserved.insert("/**", "site");
        assert!(reserved.is_empty());
    }

    #[test]
    fn test_check_reports_conflict() {
        let mut reserved = ReservedPaths::new();
        reserved.insert("/todo", "todo-plugin");
        let err = reserved.check("/todo").unwrap_err();
        assert!(matches!(err, Error::RouteConflict { ref plugin, .. } if plugin == "todo-plugin"));
        assert!(reserved.check("/notes").is_ok());
    }
}
