//! Public-route patterns.
//!
//! `publicRoutes` is either a flat glob list (every method) or an object
//! keyed by HTTP method plus `ALL`. Each set is compiled once into one
//! regex per method bucket.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::http::Method;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bucket that applies to every method.
pub const ALL_METHODS: &str = "ALL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PublicRoutes {
    List(Vec<String>),
    ByMethod(BTreeMap<String, Vec<String>>),
}

impl Default for PublicRoutes {
    fn default() -> Self {
        PublicRoutes::List(Vec::new())
    }
}

impl PublicRoutes {
    pub fn is_empty(&self) -> bool {
        match self {
            PublicRoutes::List(list) => list.is_empty(),
            PublicRoutes::ByMethod(map) => map.values().all(Vec::is_empty),
        }
    }

    fn buckets(&self) -> Vec<(String, &[String])> {
        match self {
            PublicRoutes::List(list) => vec![(ALL_METHODS.to_string(), list.as_slice())],
            PublicRoutes::ByMethod(map) => map
                .iter()
                .map(|(method, list)| (method.to_ascii_uppercase(), list.as_slice()))
                .collect(),
        }
    }
}

/// Compiled form of a [`PublicRoutes`] set, anchored under a base path.
#[derive(Debug, Default)]
pub struct RouteMatcher {
    all: Option<Regex>,
    methods: HashMap<String, Regex>,
}

impl RouteMatcher {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn compile(routes: &PublicRoutes, base: &str) -> Result<Self> {
        let mut matcher = Self::default();

        for (method, patterns) in routes.buckets() {
            if patterns.is_empty() {
                continue;
            }

            let alternatives: Vec<String> = patterns
                .iter()
                .map(|pattern| glob_to_regex(&join_base(base, pattern)))
                .collect();
            let source = format!("^(?:{})$", alternatives.join("|"));
            let regex = Regex::new(&source).map_err(|e| {
                Error::validation(format!("invalid public route pattern: {}", e))
            })?;

            if method == ALL_METHODS {
                matcher.all = Some(regex);
            } else {
                matcher.methods.insert(method, regex);
            }
        }

        Ok(matcher)
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_none() && self.methods.is_empty()
    }

    /// True when `path` matches under any method.
    pub fn matches_path(&self, path: &str) -> bool {
        self.all.as_ref().is_some_and(|re| re.is_match(path))
            || self.methods.values().any(|re| re.is_match(path))
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if self.all.as_ref().is_some_and(|re| re.is_match(path)) {
            return true;
        }
        self.methods
            .get(method.as_str())
            .is_some_and(|re| re.is_match(path))
    }
}

/// Compiled matchers keyed by pattern set and base, so each distinct set is
/// compiled once no matter how many requests use it.
#[derive(Default)]
pub struct MatcherCache {
    cache: DashMap<String, Arc<RouteMatcher>>,
}

impl MatcherCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, routes: &PublicRoutes, base: &str) -> Result<Arc<RouteMatcher>> {
        if routes.is_empty() {
            return Ok(Arc::new(RouteMatcher::empty()));
        }

        let key = format!("{}\n{}", base, serde_json::to_string(routes)?);
        if let Some(matcher) = self.cache.get(&key) {
            return Ok(matcher.clone());
        }

        let matcher = Arc::new(RouteMatcher::compile(routes, base)?);
        self.cache.insert(key, matcher.clone());
        Ok(matcher)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn join_base(base: &str, pattern: &str) -> String {
    let base = base.trim_end_matches('/');
    let pattern = pattern.trim();
    if pattern.starts_with('/') {
        format!("{}{}", base, pattern)
    } else {
        format!("{}/{}", base, pattern)
    }
}

/// Translate a glob into a regex body.
///
/// `*` and `?` stay within one path segment, `**` crosses segments, and a
/// trailing `/**` also matches the bare prefix.
pub fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if i + 2 == chars.len() && out.ends_with('/') {
                    out.pop();
                    out.push_str("(?:/.*)?");
                } else {
                    out.push_str(".*");
                }
                i += 2;
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
        i += 1;
    }

    out
}
