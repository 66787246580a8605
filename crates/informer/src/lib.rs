//! Dynamic Informer Factory: shared, reference-counted list+watch loops over
//! arbitrary resource types, each backed by a read-only store and a set of
//! registered event handlers.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::TryStreamExt;
use kube::api::Api;
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use metak_discovery::ApiMeta;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch as watch_ch;
use tracing::{debug, info, warn};

mod store;

pub use store::Store;

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(Arc<Value>),
    Deleted(Arc<Value>),
}

/// Receives informer events. Handlers must be cheap; anything heavier than
/// enqueueing a key belongs on a work queue.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &WatchEvent);
}

/// One shared list+watch over a resource type. Obtained from the factory;
/// the same instance is lent to every subscriber of the type.
pub struct SharedInformer {
    gvk_key: String,
    store: Arc<Store>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    synced_rx: watch_ch::Receiver<bool>,
}

impl SharedInformer {
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    pub fn gvk_key(&self) -> &str {
        &self.gvk_key
    }

    /// Register a handler and replay the current store to it so late
    /// subscribers observe every live object.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        for obj in self.store.list() {
            handler.handle(&WatchEvent::Applied(obj));
        }
        self.handlers.write().unwrap().push(handler);
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Block until the initial list has populated the store, or fail at the
    /// deadline.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.synced_rx.clone();
        tokio::time::timeout(timeout, async move {
            while !*rx.borrow() {
                rx.changed().await.ok();
            }
        })
        .await
        .with_context(|| format!("cache sync timed out for {}", self.gvk_key))
    }

    fn dispatch(&self, event: &WatchEvent) {
        for h in self.handlers.read().unwrap().iter() {
            h.handle(event);
        }
    }
}

struct SharedEntry {
    informer: Arc<SharedInformer>,
    task: tokio::task::JoinHandle<()>,
    refs: usize,
}

/// Lends shared informers keyed by resource type, reference-counted so the
/// underlying watch stops when the last subscriber releases it.
pub struct InformerFactory {
    client: Client,
    shared: Mutex<FxHashMap<String, SharedEntry>>,
}

fn relist_secs() -> u64 {
    std::env::var("METAK_RELIST_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(300)
}

fn backoff_max_secs() -> u64 {
    std::env::var("METAK_WATCH_BACKOFF_MAX_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30)
}

impl InformerFactory {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            shared: Mutex::new(FxHashMap::default()),
        }
    }

    /// Get (or start) the shared informer for a resolved resource type.
    pub fn subscribe(&self, meta: &ApiMeta) -> Arc<SharedInformer> {
        let key = format!("{}/{}", meta.api_version(), meta.resource.plural);
        let mut shared = self.shared.lock().unwrap();
        if let Some(entry) = shared.get_mut(&key) {
            entry.refs += 1;
            return Arc::clone(&entry.informer);
        }

        let (synced_tx, synced_rx) = watch_ch::channel(false);
        let informer = Arc::new(SharedInformer {
            gvk_key: key.clone(),
            store: Arc::new(Store::default()),
            handlers: RwLock::new(Vec::new()),
            synced_rx,
        });
        let task = tokio::spawn(run_watch(
            self.client.clone(),
            meta.clone(),
            Arc::clone(&informer),
            synced_tx,
        ));
        info!(gvk = %key, "informer started");
        shared.insert(
            key,
            SharedEntry {
                informer: Arc::clone(&informer),
                task,
                refs: 1,
            },
        );
        informer
    }

    /// Drop one subscription; the last release stops the watch task.
    pub fn release(&self, meta: &ApiMeta) {
        let key = format!("{}/{}", meta.api_version(), meta.resource.plural);
        let mut shared = self.shared.lock().unwrap();
        let last = match shared.get_mut(&key) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            None => false,
        };
        if last {
            if let Some(entry) = shared.remove(&key) {
                entry.task.abort();
                info!(gvk = %key, "informer stopped");
            }
        }
    }

    /// Stop every informer regardless of refcounts. Shutdown path only.
    pub fn shutdown(&self) {
        let mut shared = self.shared.lock().unwrap();
        for (key, entry) in shared.drain() {
            entry.task.abort();
            debug!(gvk = %key, "informer aborted on shutdown");
        }
    }
}

fn object_key(obj: &DynamicObject) -> String {
    metak_core::join_key(
        obj.metadata.namespace.as_deref(),
        obj.metadata.name.as_deref().unwrap_or_default(),
    )
}

fn to_raw(obj: &DynamicObject, meta: &ApiMeta) -> Result<Arc<Value>> {
    let mut raw = serde_json::to_value(obj).context("serializing watched object")?;
    // watch streams omit type info on items; reinstate it so consumers see
    // self-describing objects
    if raw.get("apiVersion").map(Value::is_null).unwrap_or(true) {
        raw["apiVersion"] = Value::String(meta.api_version());
    }
    if raw.get("kind").map(Value::is_null).unwrap_or(true) {
        raw["kind"] = Value::String(meta.resource.kind.clone());
    }
    if let Some(m) = raw.get_mut("metadata").and_then(Value::as_object_mut) {
        m.remove("managedFields");
    }
    Ok(Arc::new(raw))
}

/// The list+watch loop: the first event replaces the store wholesale, later
/// events mutate it; errors restart the stream with exponential backoff and
/// a periodic relist guards against drift.
async fn run_watch(
    client: Client,
    meta: ApiMeta,
    informer: Arc<SharedInformer>,
    synced_tx: watch_ch::Sender<bool>,
) {
    let gvk = informer.gvk_key.clone();
    let relist = relist_secs();
    let backoff_max = backoff_max_secs();
    let mut backoff: u64 = 1;

    loop {
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &meta.resource);
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);

        let relist_timer = tokio::time::sleep(Duration::from_secs(relist.max(1)));
        tokio::pin!(relist_timer);

        let errored = loop {
            tokio::select! {
                maybe_ev = stream.try_next() => {
                    match maybe_ev {
                        Ok(Some(Event::Restarted(list))) => {
                            debug!(gvk = %gvk, count = list.len(), "watch (re)listed");
                            let mut next = FxHashMap::default();
                            let mut applied = Vec::with_capacity(list.len());
                            for o in &list {
                                match to_raw(o, &meta) {
                                    Ok(raw) => {
                                        next.insert(object_key(o), Arc::clone(&raw));
                                        applied.push(raw);
                                    }
                                    Err(e) => warn!(gvk = %gvk, error = %e, "dropping undecodable object"),
                                }
                            }
                            let gone = informer.store.replace(next);
                            for raw in applied {
                                informer.dispatch(&WatchEvent::Applied(raw));
                            }
                            for raw in gone {
                                informer.dispatch(&WatchEvent::Deleted(raw));
                            }
                            let _ = synced_tx.send(true);
                        }
                        Ok(Some(Event::Applied(o))) => {
                            match to_raw(&o, &meta) {
                                Ok(raw) => {
                                    informer.store.insert(object_key(&o), Arc::clone(&raw));
                                    informer.dispatch(&WatchEvent::Applied(raw));
                                }
                                Err(e) => warn!(gvk = %gvk, error = %e, "dropping undecodable object"),
                            }
                        }
                        Ok(Some(Event::Deleted(o))) => {
                            let key = object_key(&o);
                            let raw = informer.store.remove(&key);
                            match raw {
                                Some(raw) => informer.dispatch(&WatchEvent::Deleted(raw)),
                                None => match to_raw(&o, &meta) {
                                    Ok(raw) => informer.dispatch(&WatchEvent::Deleted(raw)),
                                    Err(e) => warn!(gvk = %gvk, error = %e, "dropping undecodable tombstone"),
                                },
                            }
                        }
                        Ok(None) => break true,
                        Err(e) => {
                            warn!(gvk = %gvk, error = %e, "watch stream error; will backoff and restart");
                            counter!("watch_errors_total", 1u64);
                            break true;
                        }
                    }
                }
                _ = &mut relist_timer => {
                    debug!(gvk = %gvk, "periodic relist; restarting watch");
                    counter!("relist_total", 1u64);
                    break false;
                }
            }
        };

        if errored {
            let dur = Duration::from_secs(backoff.min(backoff_max));
            tokio::time::sleep(dur).await;
            backoff = (backoff * 2).min(backoff_max).max(1);
        } else {
            backoff = 1;
        }
        counter!("watch_restarts_total", 1u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Recorder(Mutex<Vec<String>>);

    impl EventHandler for Recorder {
        fn handle(&self, event: &WatchEvent) {
            let tag = match event {
                WatchEvent::Applied(o) => format!("+{}", o["metadata"]["name"].as_str().unwrap()),
                WatchEvent::Deleted(o) => format!("-{}", o["metadata"]["name"].as_str().unwrap()),
            };
            self.0.lock().unwrap().push(tag);
        }
    }

    fn informer_for_tests() -> (Arc<SharedInformer>, watch_ch::Sender<bool>) {
        let (tx, rx) = watch_ch::channel(false);
        (
            Arc::new(SharedInformer {
                gvk_key: "v1/pods".into(),
                store: Arc::new(Store::default()),
                handlers: RwLock::new(Vec::new()),
                synced_rx: rx,
            }),
            tx,
        )
    }

    #[test]
    fn add_handler_replays_store() {
        let (informer, _tx) = informer_for_tests();
        informer
            .store
            .insert("ns/a".into(), Arc::new(json!({"metadata": {"name": "a"}})));
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        informer.add_handler(rec.clone());
        informer.dispatch(&WatchEvent::Deleted(Arc::new(
            json!({"metadata": {"name": "a"}}),
        )));
        assert_eq!(*rec.0.lock().unwrap(), vec!["+a", "-a"]);
    }

    #[tokio::test]
    async fn wait_for_sync_observes_flip() {
        let (informer, tx) = informer_for_tests();
        assert!(!informer.has_synced());
        let waiter = {
            let informer = Arc::clone(&informer);
            tokio::spawn(async move { informer.wait_for_sync(Duration::from_secs(5)).await })
        };
        tx.send(true).unwrap();
        waiter.await.unwrap().unwrap();
        assert!(informer.has_synced());
    }

    #[tokio::test]
    async fn wait_for_sync_times_out() {
        let (informer, _tx) = informer_for_tests();
        let err = informer
            .wait_for_sync(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cache sync timed out"));
    }
}
