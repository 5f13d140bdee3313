//! Classification of paths relative to an apps root.

use serde::Serialize;

use super::version::is_version_segment;
use super::Layout;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub app_name: Option<String>,
    pub version: Option<String>,
    pub layout: Option<Layout>,
    /// Depth counted in nested-layout levels (`name@v` counts as two).
    pub depth: usize,
    /// True when the path is a version directory or something inside one.
    pub inside_version: bool,
}

pub fn classify(path: &str) -> PathInfo {
    let segments: Vec<&str> = path
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let Some(first) = segments.first() else {
        return PathInfo::default();
    };

    if let Some(idx) = first.rfind('@').filter(|idx| *idx > 0) {
        let version = &first[idx + 1..];
        if is_version_segment(version) {
            return PathInfo {
                app_name: Some(first[..idx].to_string()),
                version: Some(version.to_string()),
                layout: Some(Layout::Flat),
                depth: segments.len() + 1,
                inside_version: true,
            };
        }
    }

    let version = segments
        .get(1)
        .filter(|segment| is_version_segment(segment))
        .map(|segment| segment.to_string());

    PathInfo {
        app_name: Some(first.to_string()),
        inside_version: version.is_some(),
        version,
        layout: Some(Layout::Nested),
        depth: segments.len(),
    }
}

/// File mutations are only allowed at or below a version directory.
pub fn is_valid_upload_destination(path: &str) -> bool {
    classify(path).inside_version
}
