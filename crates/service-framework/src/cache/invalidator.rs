//! Evicts a service's cached reads whenever one of its entities changes.

use super::Cacher;
use crate::store::entity::{EntityChangedEvent, EntityListener};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Listener bound to one namespace at construction.
///
/// An eviction failure never fails the mutation that triggered it. It is
/// logged at `error` level and counted in [`CacheInvalidator::failures`].
pub struct CacheInvalidator {
    namespace: String,
    pattern: String,
    cacher: Arc<dyn Cacher>,
    failures: AtomicU64,
}

impl CacheInvalidator {
    pub fn new(namespace: impl Into<String>, cacher: Arc<dyn Cacher>) -> Self {
        let namespace = namespace.into();
        Self {
            pattern: format!("{namespace}.*"),
            namespace,
            cacher,
            failures: AtomicU64::new(0),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Evictions that failed since start.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EntityListener for CacheInvalidator {
    async fn entity_changed(&self, event: &EntityChangedEvent) {
        if event.namespace != self.namespace {
            debug!(namespace = %self.namespace, other = %event.namespace, "Ignoring foreign change");
            return;
        }
        match self.cacher.clean(&self.pattern).await {
            Ok(evicted) => debug!(pattern = %self.pattern, evicted, "Cache cleaned"),
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    namespace = %self.namespace,
                    operation = ?event.operation,
                    failures,
                    error = %e,
                    "Cache invalidation failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::mock::RecordingCacher;
    use crate::store::entity::Operation;
    use serde_json::Map;

    fn event(namespace: &str) -> EntityChangedEvent {
        EntityChangedEvent {
            operation: Operation::Update,
            namespace: namespace.to_string(),
            entity: None,
            previous: None,
            context: CallContext::new(),
            options: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_one_clean_per_change() {
        let cacher = Arc::new(RecordingCacher::new());
        let invalidator = CacheInvalidator::new("products", cacher.clone());

        invalidator.entity_changed(&event("products")).await;
        invalidator.entity_changed(&event("greeter")).await;

        assert_eq!(cacher.cleaned(), vec!["products.*".to_string()]);
        assert_eq!(invalidator.failures(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_counted_not_raised() {
        let cacher = Arc::new(RecordingCacher::failing());
        let invalidator = CacheInvalidator::new("products", cacher.clone());

        invalidator.entity_changed(&event("products")).await;
        invalidator.entity_changed(&event("products")).await;

        assert_eq!(invalidator.failures(), 2);
        assert_eq!(cacher.cleaned().len(), 2);
    }
}
