//! Plugins shipped with the server, enabled from the `plugins` config list.

pub mod metrics;
pub mod request_log;

use crate::config::PluginEntry;
use crate::error::{Error, Result};

use super::Plugin;

/// Build the built-in plugin named by `entry`.
pub fn create(entry: &PluginEntry) -> Result<Plugin> {
    let plugin = match entry.name.as_str() {
        request_log::NAME => request_log::plugin(&entry.config)?,
        metrics::NAME => metrics::plugin(),
        other => {
            return Err(Error::Config(format!("unknown plugin '{}'", other)));
        }
    };

    let plugin = plugin.config(entry.config.clone());
    Ok(match &entry.base {
        Some(base) => plugin.base(base.clone()),
        None => plugin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_and_unknown() {
        let entry = PluginEntry {
            name: "metrics".into(),
            base: Some("/_metrics".into()),
            config: serde_json::Value::Null,
        };
        let plugin = create(&entry).unwrap();
        assert_eq!(plugin.name(), "metrics");
        assert_eq!(plugin.base.as_deref(), Some("/_metrics"));

        let entry = PluginEntry {
            name: "nope".into(),
            base: None,
            config: serde_json::Value::Null,
        };
        assert!(matches!(create(&entry), Err(Error::Config(_))));
    }
}
