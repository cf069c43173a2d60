//! Worker capability trait and the per-node registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

/// The capability set a per-rule worker exposes.
///
/// A worker holds no reference back to its manager; the manager knows
/// workers only by name through the registry.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// The rule key this worker evaluates.
    fn name(&self) -> &str;

    /// Drive the evaluation loop until stopped.
    async fn run(&self);

    /// Signal the loop to exit; cancels in-flight work.
    fn stop(&self);

    /// Serialized rule record with live alert state, for checkpointing.
    fn snapshot(&self) -> Option<String>;
}

/// A registered worker and its task handle.
pub struct RegistryItem {
    pub worker: Arc<dyn Worker>,
    pub handle: JoinHandle<()>,
}

/// Map rule-name → running worker.
///
/// All mutators are short; iteration returns a snapshot so shutdown and
/// rebalance can mutate concurrently with readers.
#[derive(Default)]
pub struct Registry {
    items: Mutex<HashMap<String, RegistryItem>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a worker, returning any displaced item.
    pub fn set(
        &self,
        name: &str,
        worker: Arc<dyn Worker>,
        handle: JoinHandle<()>,
    ) -> Option<RegistryItem> {
        self.items
            .lock()
            .unwrap()
            .insert(name.to_string(), RegistryItem { worker, handle })
    }

    /// Whether a worker is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.items.lock().unwrap().contains_key(name)
    }

    /// The worker registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.items
            .lock()
            .unwrap()
            .get(name)
            .map(|item| Arc::clone(&item.worker))
    }

    /// Remove and return the item under `name`.
    pub fn remove(&self, name: &str) -> Option<RegistryItem> {
        self.items.lock().unwrap().remove(name)
    }

    /// Snapshot of registered names.
    pub fn names(&self) -> Vec<String> {
        self.items.lock().unwrap().keys().cloned().collect()
    }

    /// Snapshot of (name, worker) pairs.
    pub fn iter(&self) -> Vec<(String, Arc<dyn Worker>)> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .map(|(name, item)| (name.clone(), Arc::clone(&item.worker)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopWorker {
        name: String,
    }

    #[async_trait]
    impl Worker for NopWorker {
        fn name(&self) -> &str {
            &self.name
        }
        async fn run(&self) {}
        fn stop(&self) {}
        fn snapshot(&self) -> Option<String> {
            None
        }
    }

    fn item(name: &str) -> (Arc<dyn Worker>, JoinHandle<()>) {
        let worker: Arc<dyn Worker> = Arc::new(NopWorker {
            name: name.to_string(),
        });
        (worker, tokio::spawn(async {}))
    }

    #[tokio::test]
    async fn set_get_remove() {
        let registry = Registry::new();
        let (worker, handle) = item("/scalers/os1/a");
        assert!(registry.set("/scalers/os1/a", worker, handle).is_none());

        assert!(registry.contains("/scalers/os1/a"));
        assert_eq!(registry.get("/scalers/os1/a").unwrap().name(), "/scalers/os1/a");
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("/scalers/os1/a").is_some());
        assert!(registry.is_empty());
        assert!(registry.remove("/scalers/os1/a").is_none());
    }

    #[tokio::test]
    async fn set_returns_displaced_item() {
        let registry = Registry::new();
        let (w1, h1) = item("/scalers/os1/a");
        let (w2, h2) = item("/scalers/os1/a");
        registry.set("/scalers/os1/a", w1, h1);
        let displaced = registry.set("/scalers/os1/a", w2, h2);
        assert!(displaced.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn iter_is_a_snapshot() {
        let registry = Registry::new();
        for name in ["/scalers/os1/a", "/scalers/os1/b"] {
            let (w, h) = item(name);
            registry.set(name, w, h);
        }
        let snapshot = registry.iter();
        // Mutating after the snapshot does not disturb it.
        registry.remove("/scalers/os1/a");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 1);
    }
}
