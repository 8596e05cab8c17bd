//! Local key/value storage capability.
//!
//! The foreground owns the persistent storage; the worker sees a mirror of
//! it shipped with `init` and pushes its own writes back in batches.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Minimal synchronous key/value store.
pub trait KeyValueStorage: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key at position `index`, in storage order.
    fn key(&self, index: usize) -> Option<String>;

    fn get_item(&self, key: &str) -> Option<String>;

    fn set_item(&self, key: &str, value: &str);

    fn remove_item(&self, key: &str);

    fn clear(&self);

    /// Every entry, in storage order.
    fn entries(&self) -> BTreeMap<String, String> {
        (0..self.len())
            .filter_map(|i| self.key(i))
            .filter_map(|k| self.get_item(&k).map(|v| (k, v)))
            .collect()
    }

    /// Apply a batch of writes; `None` removes.
    fn apply(&self, items: &BTreeMap<String, Option<String>>) {
        for (key, value) in items {
            match value {
                Some(value) => self.set_item(key, value),
                None => self.remove_item(key),
            }
        }
    }
}

/// Process-local storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> R) -> R {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut items)
    }
}

impl KeyValueStorage for MemoryStorage {
    fn len(&self) -> usize {
        self.with(|items| items.len())
    }

    fn key(&self, index: usize) -> Option<String> {
        self.with(|items| items.keys().nth(index).cloned())
    }

    fn get_item(&self, key: &str) -> Option<String> {
        self.with(|items| items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) {
        self.with(|items| items.insert(key.to_owned(), value.to_owned()));
    }

    fn remove_item(&self, key: &str) {
        self.with(|items| items.remove(key));
    }

    fn clear(&self) {
        self.with(BTreeMap::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_sets_and_removes() {
        let storage = MemoryStorage::new();
        storage.set_item("a", "1");
        storage.set_item("b", "2");
        let batch = BTreeMap::from([("a".to_owned(), None), ("c".to_owned(), Some("3".to_owned()))]);
        storage.apply(&batch);
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.key(0).as_deref(), Some("b"));
        assert_eq!(storage.get_item("c").as_deref(), Some("3"));
        assert_eq!(storage.get_item("a"), None);
    }
}
