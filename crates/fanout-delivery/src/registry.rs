//! Task registry: maps task kinds to their adapters.
//!
//! Built once at engine startup and shared read-only by every worker.
//! An envelope whose kind has no adapter is a permanent failure, not a
//! retryable one; re-dequeueing it cannot conjure an adapter.

use std::{collections::HashMap, fmt, sync::Arc};

use fanout_core::TaskKind;

use crate::{
    adapter::DeliveryAdapter,
    error::{DeliveryError, Result},
};

/// Immutable mapping from task kind to delivery adapter.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    adapters: HashMap<TaskKind, Arc<dyn DeliveryAdapter>>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own kind, replacing any previous
    /// adapter for that kind.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn DeliveryAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    /// Looks up the adapter for a task kind.
    pub fn adapter_for(&self, kind: TaskKind) -> Result<Arc<dyn DeliveryAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| DeliveryError::AdapterNotRegistered { kind: kind.to_string() })
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapters are registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use fanout_core::Envelope;

    use super::*;
    use crate::adapter::DeliveryReceipt;

    #[derive(Debug)]
    struct StubAdapter(TaskKind);

    #[async_trait]
    impl DeliveryAdapter for StubAdapter {
        fn kind(&self) -> TaskKind {
            self.0
        }

        async fn deliver(&self, _envelope: &Envelope) -> Result<DeliveryReceipt> {
            Ok(DeliveryReceipt::published(std::time::Duration::ZERO))
        }
    }

    #[test]
    fn lookup_returns_registered_adapter() {
        let registry =
            TaskRegistry::new().with_adapter(Arc::new(StubAdapter(TaskKind::WebhookNotify)));

        assert!(registry.adapter_for(TaskKind::WebhookNotify).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_adapter_is_a_permanent_error() {
        let registry = TaskRegistry::new();
        let error = registry.adapter_for(TaskKind::PubSubNotify).unwrap_err();

        assert!(matches!(error, DeliveryError::AdapterNotRegistered { .. }));
        assert!(!error.is_retryable());
    }
}
