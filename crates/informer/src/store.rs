//! Read-only object cache backing an informer (the lister).

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, RwLock};

/// Objects keyed by "{ns}/{name}". Writers are the informer task only;
/// readers are reconcile workers and event handlers.
#[derive(Default)]
pub struct Store {
    inner: RwLock<FxHashMap<String, Arc<Value>>>,
}

impl Store {
    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Value>> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    pub(crate) fn insert(&self, key: String, obj: Arc<Value>) {
        self.inner.write().unwrap().insert(key, obj);
    }

    pub(crate) fn remove(&self, key: &str) -> Option<Arc<Value>> {
        self.inner.write().unwrap().remove(key)
    }

    /// Replace contents with a freshly listed set; returns the objects that
    /// were present before but are gone now.
    pub(crate) fn replace(&self, next: FxHashMap<String, Arc<Value>>) -> Vec<Arc<Value>> {
        let mut inner = self.inner.write().unwrap();
        let gone = inner
            .iter()
            .filter(|(k, _)| !next.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect();
        *inner = next;
        gone
    }
}
