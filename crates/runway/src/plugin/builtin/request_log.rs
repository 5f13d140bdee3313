//! Access log with per-request timing.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};
use wildmatch::WildMatch;

use crate::error::{Error, Result};
use crate::plugin::{Plugin, RequestFlow};

pub const NAME: &str = "request-log";

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RequestLogConfig {
    /// Wildcard patterns of paths that are never logged.
    ignore: Vec<String>,
    /// Requests slower than this are logged as warnings.
    slow_ms: u64,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            slow_ms: 1000,
        }
    }
}

struct Filter {
    ignore: Vec<WildMatch>,
}

impl Filter {
    fn ignored(&self, path: &str) -> bool {
        self.ignore.iter().any(|pattern| pattern.matches(path))
    }
}

pub fn plugin(config: &serde_json::Value) -> Result<Plugin> {
    let config: RequestLogConfig = if config.is_null() {
        RequestLogConfig::default()
    } else {
        serde_json::from_value(config.clone())
            .map_err(|e| Error::Config(format!("{}: {}", NAME, e)))?
    };

    let filter = Arc::new(Filter {
        ignore: config.ignore.iter().map(|p| WildMatch::new(p)).collect(),
    });
    let slow = Duration::from_millis(config.slow_ms);

    let request_filter = filter.clone();
    Ok(Plugin::new(NAME)
        .on_request(move |req, app| {
            let filter = request_filter.clone();
            async move {
                if !filter.ignored(req.uri().path()) {
                    debug!(
                        app = app.as_ref().map(|a| a.name.as_str()),
                        "--> {} {}",
                        req.method(),
                        req.uri()
                    );
                }
                Ok(RequestFlow::Continue(req))
            }
        })
        .on_response(move |res, ctx| {
            let filter = filter.clone();
            async move {
                if filter.ignored(&ctx.path) {
                    return Ok(res);
                }
                let elapsed = ctx.started.elapsed();
                let app = ctx.app.as_ref().map(|a| a.name.as_str());
                if elapsed >= slow {
                    warn!(
                        app,
                        "<-- {} {} {} slow ({:?})",
                        ctx.method,
                        ctx.path,
                        res.status().as_u16(),
                        elapsed
                    );
                } else {
                    info!(
                        app,
                        "<-- {} {} {} ({:?})",
                        ctx.method,
                        ctx.path,
                        res.status().as_u16(),
                        elapsed
                    );
                }
                Ok(res)
            }
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parsing() {
        assert!(plugin(&serde_json::Value::Null).is_ok());
        assert!(plugin(&serde_json::json!({"ignore": ["/assets/*"], "slowMs": 10})).is_ok());
        assert!(plugin(&serde_json::json!({"slowMs": "fast"})).is_err());
    }

    #[test]
    fn test_filter() {
        let filter = Filter {
            ignore: vec![WildMatch::new("/assets/*"), WildMatch::new("*.png")],
        };
        assert!(filter.ignored("/assets/js/app.js"));
        assert!(filter.ignored("/todo/logo.png"));
        assert!(!filter.ignored("/todo/"));
    }
}
