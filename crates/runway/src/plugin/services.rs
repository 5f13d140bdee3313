//! Cross-plugin service locator.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

/// Named services plugins share with each other.
///
/// Filled while plugins initialize and read afterwards.
#[derive(Default)]
pub struct ServiceLocator {
    services: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServiceLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under `name`, replacing any previous one.
    pub fn register<T: Any + Send + Sync>(&self, name: impl Into<String>, service: Arc<T>) {
        let name = name.into();
        if self.services.insert(name.clone(), service).is_some() {
            tracing::warn!("Service '{}' was registered twice, keeping the newest", name);
        }
    }

    /// Look up `name` as a `T`. `None` when missing or of another type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let service = self.services.get(name)?.value().clone();
        service.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);

    #[test]
    fn test_register_and_get() {
        let services = ServiceLocator::new();
        services.register("counter", Arc::new(Counter(7)));

        let counter = services.get::<Counter>("counter").unwrap();
        assert_eq!(counter.0, 7);
        assert!(services.get::<String>("counter").is_none());
        assert!(services.get::<Counter>("missing").is_none());
        assert_eq!(services.names(), vec!["counter".to_string()]);
    }
}
