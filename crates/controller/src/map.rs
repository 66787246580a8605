//! The supervisor-owned map of running watch-controllers. Only ever touched
//! by its supervisor's single worker, so it needs no lock.

use crate::watch::WatchController;
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Default)]
pub struct ControllerMap {
    inner: FxHashMap<String, WatchController>,
}

impl ControllerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&WatchController> {
        self.inner.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn insert(&mut self, key: String, controller: WatchController) {
        self.inner.insert(key, controller);
    }

    pub fn remove(&mut self, key: &str) -> Option<WatchController> {
        self.inner.remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Stop every controller concurrently and join them.
    pub async fn stop_all(self) {
        let mut stops = tokio::task::JoinSet::new();
        for (key, controller) in self.inner {
            stops.spawn(async move {
                controller.stop().await;
                debug!(ctrl = %key, "controller stopped on shutdown");
            });
        }
        while stops.join_next().await.is_some() {}
    }
}
