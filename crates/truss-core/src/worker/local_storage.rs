// ── Worker-side local storage ──
//
// The worker cannot reach the foreground's persistent storage, so it works
// on a mirror shipped with `init`. Writes made on the worker side are
// collected and pushed back as one `updateLocalStorage` reply per scheduler
// turn; writes arriving from the foreground are applied without echo.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::trace;
use truss_api::Reply;

use crate::outbox::Outbox;
use crate::storage::KeyValueStorage;

pub struct LocalStorageShim {
    me: Weak<LocalStorageShim>,
    items: Mutex<BTreeMap<String, String>>,
    changes: Mutex<BTreeMap<String, Option<String>>>,
    outbox: Arc<Outbox<Reply>>,
}

impl std::fmt::Debug for LocalStorageShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorageShim")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl LocalStorageShim {
    pub(crate) fn new(outbox: Arc<Outbox<Reply>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            items: Mutex::new(BTreeMap::new()),
            changes: Mutex::new(BTreeMap::new()),
            outbox,
        })
    }

    /// Replace the mirror with the foreground's contents.
    pub(crate) fn init(&self, items: BTreeMap<String, String>) {
        *self.items.lock().unwrap_or_else(PoisonError::into_inner) = items;
    }

    /// Apply writes made by the foreground.
    pub(crate) fn apply_remote(&self, changes: &BTreeMap<String, Option<String>>) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in changes {
            match value {
                Some(value) => items.insert(key.clone(), value.clone()),
                None => items.remove(key),
            };
        }
    }

    fn record(&self, key: String, value: Option<String>) {
        let first = {
            let mut changes = self.changes.lock().unwrap_or_else(PoisonError::into_inner);
            changes.insert(key, value);
            changes.len() == 1
        };
        if first {
            if let Some(me) = self.me.upgrade() {
                tokio::spawn(async move { me.flush() });
            }
        }
    }

    fn flush(&self) {
        // Held until the batch is queued so a later flush cannot overtake it.
        let mut changes = self.changes.lock().unwrap_or_else(PoisonError::into_inner);
        if changes.is_empty() {
            return;
        }
        let items = std::mem::take(&mut *changes);
        trace!(count = items.len(), "forwarding local storage changes");
        self.outbox.push(Reply::UpdateLocalStorage { items });
    }

    fn with<R>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> R) -> R {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut items)
    }
}

impl KeyValueStorage for LocalStorageShim {
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
        self.record(key.to_owned(), Some(value.to_owned()));
    }

    fn remove_item(&self, key: &str) {
        self.with(|items| items.remove(key));
        self.record(key.to_owned(), None);
    }

    fn clear(&self) {
        let keys: Vec<String> = self.with(|items| std::mem::take(items).into_keys().collect());
        for key in keys {
            self.record(key, None);
        }
    }
}
