//! Backend registration and ordering.

use crate::backend::ExtractionBackend;
use std::sync::Arc;
use tracing::debug;

/// One registered backend with its chain position.
#[derive(Clone)]
pub struct RegisteredBackend {
    /// Name under which the backend was registered
    pub name: String,
    /// Priority level; lowest is tried first
    pub priority: u8,
    /// Registration order, breaks priority ties
    seq: usize,
    /// The backend itself
    pub backend: Arc<dyn ExtractionBackend>,
}

/// Priority-ordered registry of extraction backends.
///
/// Iteration order is ascending priority, ties broken by registration
/// order. Ordering is fixed at registration time; the chain executor
/// only ever iterates.
#[derive(Default)]
pub struct BackendRegistry {
    entries: Vec<RegisteredBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend at the given priority level.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn ExtractionBackend>,
        priority: u8,
    ) {
        let name = name.into();
        debug!(backend = %name, priority = priority, "Registered backend");
        let seq = self.entries.len();
        self.entries.push(RegisteredBackend {
            name,
            priority,
            seq,
            backend,
        });
        self.entries
            .sort_by_key(|entry| (entry.priority, entry.seq));
    }

    /// Iterate backends in chain order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.entries.iter()
    }

    /// Registered backend names in chain order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionResult, Item, Result};
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl ExtractionBackend for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn attempt(&self, _item: &Item) -> Result<ExtractionResult> {
            Ok(ExtractionResult::ok(self.0, serde_json::json!({}), 1.0, 0.0, 0))
        }
    }

    #[test]
    fn orders_by_priority_then_registration() {
        let mut registry = BackendRegistry::new();
        registry.register("ocr", Arc::new(Named("ocr")), 1);
        registry.register("metadata", Arc::new(Named("metadata")), 0);
        registry.register("cloud-b", Arc::new(Named("cloud-b")), 2);
        registry.register("cloud-a", Arc::new(Named("cloud-a")), 2);

        assert_eq!(registry.names(), vec!["metadata", "ocr", "cloud-b", "cloud-a"]);
    }
}
