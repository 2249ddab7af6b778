//! Local snapshot of the watched objects.

use std::collections::HashMap;

use ditto_core::Meta;

/// Snapshot store keyed by `"{namespace}/{name}"`, holding each object
/// together with its cached metadata view.
///
/// Only the engine's event loop touches it: informer events and the results
/// of engine-initiated mutations land here through the same serialized loop,
/// so no locking is needed. The cached [`Meta`] is where the validation memo
/// lives; it never reaches the cluster.
#[derive(Debug, Default)]
pub struct SnapshotStore<T> {
    entries: HashMap<String, (T, Meta)>,
}

impl<T: Clone> SnapshotStore<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<(&T, &Meta)> {
        self.entries.get(key).map(|(object, meta)| (object, meta))
    }

    pub fn get_cloned(&self, key: &str) -> Option<(T, Meta)> {
        self.entries.get(key).cloned()
    }

    /// Inserts or replaces the object under its metadata key.
    pub fn insert(&mut self, object: T, meta: Meta) {
        self.entries.insert(meta.key(), (object, meta));
    }

    /// Replaces only the cached metadata (used to memoize validation).
    pub fn set_meta(&mut self, key: &str, meta: Meta) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.1 = meta;
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<(T, Meta)> {
        self.entries.remove(key)
    }

    /// All keys, sorted for deterministic iteration.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}
