//! CRD-driven meta-controller supervisor: watches GenericController custom
//! resources and keeps one watch-controller running per definition.

use anyhow::{Context, Result};
use kube::Client;
use metak_apis::GenericController;
use metak_core::raw;
use metak_discovery::{ApiMeta, ApiRegistry};
use metak_hooks::HookInvoker;
use metak_informer::{EventHandler, InformerFactory, SharedInformer, WatchEvent};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::map::ControllerMap;
use crate::queue::RateLimitingQueue;
use crate::watch::{cache_sync_timeout, WatchController};
use crate::Supervisor;

const DEFINITION_API_VERSION: &str = "metac.openebs.io/v1alpha1";
const DEFINITION_RESOURCE: &str = "genericcontrollers";

struct CrdInner {
    client: Client,
    registry: Arc<ApiRegistry>,
    factory: Arc<InformerFactory>,
    invoker: Arc<dyn HookInvoker>,
    worker_count: usize,
    queue: Arc<RateLimitingQueue<String>>,
    informer: Arc<SharedInformer>,
    meta: Arc<ApiMeta>,
}

pub struct CrdSupervisor {
    inner: Arc<CrdInner>,
    runner: Option<tokio::task::JoinHandle<()>>,
}

struct DefinitionHandler {
    queue: Arc<RateLimitingQueue<String>>,
}

impl EventHandler for DefinitionHandler {
    fn handle(&self, event: &WatchEvent) {
        let obj = match event {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        };
        if let Some(name) = raw::name(obj) {
            self.queue.add(metak_core::join_key(raw::namespace(obj), name));
        }
    }
}

impl CrdSupervisor {
    /// Fails when the GenericController CRD itself is not installed.
    pub fn new(
        client: Client,
        registry: Arc<ApiRegistry>,
        factory: Arc<InformerFactory>,
        invoker: Arc<dyn HookInvoker>,
        worker_count: usize,
    ) -> Result<Self> {
        let meta = registry
            .resolve(DEFINITION_API_VERSION, DEFINITION_RESOURCE)
            .context("resolving the GenericController definition kind")?;
        let queue = RateLimitingQueue::new();
        let informer = factory.subscribe(&meta);
        informer.add_handler(Arc::new(DefinitionHandler {
            queue: Arc::clone(&queue),
        }));
        Ok(Self {
            inner: Arc::new(CrdInner {
                client,
                registry,
                factory,
                invoker,
                worker_count,
                queue,
                informer,
                meta,
            }),
            runner: None,
        })
    }
}

#[async_trait::async_trait]
impl Supervisor for CrdSupervisor {
    fn start(&mut self) -> oneshot::Receiver<Result<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        info!("crd supervisor starting");
        let inner = Arc::clone(&self.inner);
        self.runner = Some(tokio::spawn(run(inner, done_tx)));
        done_rx
    }

    async fn stop(&mut self) {
        info!("crd supervisor stopping");
        self.inner.queue.shut_down();
        if let Some(runner) = self.runner.take() {
            let _ = runner.await;
        }
        self.inner.factory.release(&self.inner.meta);
        info!("crd supervisor stopped");
    }
}

async fn run(inner: Arc<CrdInner>, done: oneshot::Sender<Result<()>>) {
    tokio::select! {
        _ = inner.queue.closed() => {
            let _ = done.send(Ok(()));
            return;
        }
        res = inner.informer.wait_for_sync(cache_sync_timeout()) => {
            if let Err(e) = res {
                error!(error = %e, "definition informer never synced; supervisor loop aborting");
                let _ = done.send(Err(e));
                return;
            }
        }
    }
    info!("definition cache synced; supervising");

    // a single worker: this loop only starts/stops controllers, so the map
    // never needs a lock
    let mut map = ControllerMap::new();
    while let Some(key) = inner.queue.get().await {
        match sync_key(&inner, &mut map, &key).await {
            Ok(()) => inner.queue.forget(&key),
            Err(e) => {
                warn!(key = %key, error = %e, "definition sync failed; will retry");
                inner.queue.add_rate_limited(key.clone());
            }
        }
        inner.queue.done(&key);
    }

    map.stop_all().await;
    let _ = done.send(Ok(()));
}

async fn sync_key(inner: &CrdInner, map: &mut ControllerMap, key: &str) -> Result<()> {
    let Some(found) = inner.informer.store().get(key) else {
        if let Some(existing) = map.remove(key) {
            info!(key = %key, "definition deleted; stopping its controller");
            existing.stop().await;
        }
        return Ok(());
    };

    let ctrl: GenericController =
        serde_json::from_value((*found).clone()).context("decoding GenericController")?;

    if let Some(existing) = map.get(key) {
        if existing.definition().same_spec(&ctrl) {
            return Ok(());
        }
        info!(key = %key, "definition spec changed; recreating its controller");
        if let Some(existing) = map.remove(key) {
            existing.stop().await;
        }
    } else {
        info!(key = %key, "definition added; starting its controller");
    }

    let mut controller = WatchController::new(
        inner.client.clone(),
        &inner.registry,
        Arc::clone(&inner.factory),
        Arc::clone(&inner.invoker),
        ctrl,
    )?;
    controller.start(inner.worker_count);
    map.insert(key.to_string(), controller);
    Ok(())
}
