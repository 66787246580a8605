//! Per-definition watch-controller: subscribes informers for the watched
//! and attachment types, funnels events into a key queue, and reconciles
//! each watched object through the declared hooks.

use anyhow::{anyhow, bail, Context, Result};
use futures::FutureExt;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::Client;
use metak_apis::{GenericController, Hook, ResourceRule};
use metak_core::raw;
use metak_discovery::{ApiMeta, ApiRegistry};
use metak_hooks::{HookInvoker, HookResponse};
use metak_informer::{EventHandler, InformerFactory, SharedInformer, WatchEvent};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::queue::RateLimitingQueue;
use crate::reconcile::{
    build_request, finalize_outcome, owned_attachments, plan_ops, FinalizeOutcome, Op,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Constructed,
    Started,
    Running,
    Stopping,
    Stopped,
}

pub(crate) fn cache_sync_timeout() -> Duration {
    let secs = std::env::var("METAK_CACHE_SYNC_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(120);
    Duration::from_secs(secs.max(1))
}

struct Resolved {
    meta: Arc<ApiMeta>,
    informer: Arc<SharedInformer>,
}

struct ResolvedAttachment {
    rule: ResourceRule,
    resolved: Resolved,
}

struct Inner {
    ctrl: GenericController,
    key: String,
    client: Client,
    factory: Arc<InformerFactory>,
    invoker: Arc<dyn HookInvoker>,
    anno_key: String,
    finalizer: String,
    watched: Resolved,
    attachments: Vec<ResolvedAttachment>,
    /// "apiVersion/kind" -> REST metadata, for executing planned operations.
    metas_by_type: FxHashMap<String, Arc<ApiMeta>>,
    queue: Arc<RateLimitingQueue<String>>,
    phase: Mutex<Phase>,
}

/// Reconciles one GenericController definition. At most one instance runs
/// per definition key; the supervisor enforces that.
pub struct WatchController {
    inner: Arc<Inner>,
    runner: Option<tokio::task::JoinHandle<()>>,
    resync: Option<tokio::task::JoinHandle<()>>,
}

struct WatchedHandler {
    queue: Arc<RateLimitingQueue<String>>,
}

impl EventHandler for WatchedHandler {
    fn handle(&self, event: &WatchEvent) {
        let obj = match event {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        };
        if let Some(name) = raw::name(obj) {
            self.queue.add(metak_core::join_key(raw::namespace(obj), name));
        }
    }
}

struct AttachmentHandler {
    queue: Arc<RateLimitingQueue<String>>,
    watched_api_version: String,
    watched_kind: String,
    watched_namespaced: bool,
}

impl EventHandler for AttachmentHandler {
    fn handle(&self, event: &WatchEvent) {
        let obj = match event {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        };
        // resolve the owning watched object through the back-reference
        for (api_version, kind, name) in raw::owner_references(obj) {
            if api_version == self.watched_api_version && kind == self.watched_kind {
                let key = if self.watched_namespaced {
                    metak_core::join_key(raw::namespace(obj), &name)
                } else {
                    name
                };
                self.queue.add(key);
            }
        }
    }
}

impl WatchController {
    /// Resolve every declared resource and wire up informers. Fails when a
    /// kind is unknown; the supervisor retries with backoff since the kind
    /// may be registered later.
    pub fn new(
        client: Client,
        registry: &ApiRegistry,
        factory: Arc<InformerFactory>,
        invoker: Arc<dyn HookInvoker>,
        ctrl: GenericController,
    ) -> Result<Self> {
        let key = ctrl.key();
        if ctrl.spec.hooks.sync.is_none() {
            bail!("definition {} declares no sync hook", key);
        }

        let watched_meta = registry
            .resolve(&ctrl.spec.watch.api_version, &ctrl.spec.watch.resource)
            .with_context(|| format!("resolving watch for {}", key))?;
        let attachment_metas = ctrl
            .spec
            .attachments
            .iter()
            .map(|rule| {
                registry
                    .resolve(&rule.api_version, &rule.resource)
                    .with_context(|| format!("resolving attachment for {}", key))
            })
            .collect::<Result<Vec<_>>>()?;

        let queue = RateLimitingQueue::new();

        let watched = Resolved {
            informer: factory.subscribe(&watched_meta),
            meta: watched_meta,
        };
        watched.informer.add_handler(Arc::new(WatchedHandler {
            queue: Arc::clone(&queue),
        }));

        let mut metas_by_type = FxHashMap::default();
        metas_by_type.insert(
            metak_core::gvk_key(&watched.meta.api_version(), &watched.meta.resource.kind),
            Arc::clone(&watched.meta),
        );

        let mut attachments = Vec::with_capacity(attachment_metas.len());
        for (rule, meta) in ctrl.spec.attachments.iter().zip(attachment_metas) {
            let informer = factory.subscribe(&meta);
            informer.add_handler(Arc::new(AttachmentHandler {
                queue: Arc::clone(&queue),
                watched_api_version: watched.meta.api_version(),
                watched_kind: watched.meta.resource.kind.clone(),
                watched_namespaced: watched.meta.namespaced,
            }));
            metas_by_type.insert(
                metak_core::gvk_key(&meta.api_version(), &meta.resource.kind),
                Arc::clone(&meta),
            );
            attachments.push(ResolvedAttachment {
                rule: rule.clone(),
                resolved: Resolved { meta, informer },
            });
        }

        let flat_id = ctrl.flat_id();
        let inner = Arc::new(Inner {
            anno_key: metak_apply::last_applied::annotation_key(&flat_id),
            finalizer: crate::reconcile::finalizer_name(&flat_id),
            key,
            ctrl,
            client,
            factory,
            invoker,
            watched,
            attachments,
            metas_by_type,
            queue,
            phase: Mutex::new(Phase::Constructed),
        });
        Ok(Self {
            inner,
            runner: None,
            resync: None,
        })
    }

    pub fn definition(&self) -> &GenericController {
        &self.inner.ctrl
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock().unwrap()
    }

    /// Wait for informer caches, then serve the queue with `worker_count`
    /// workers. Non-blocking; the wait happens on the controller's own task.
    pub fn start(&mut self, worker_count: usize) {
        {
            let mut phase = self.inner.phase.lock().unwrap();
            if *phase != Phase::Constructed {
                warn!(ctrl = %self.inner.key, "start ignored; already {:?}", *phase);
                return;
            }
            *phase = Phase::Started;
        }
        info!(ctrl = %self.inner.key, workers = worker_count, "watch controller starting");
        self.resync = spawn_resync(Arc::clone(&self.inner));
        let inner = Arc::clone(&self.inner);
        self.runner = Some(tokio::spawn(run(inner, worker_count.max(1))));
    }

    /// Shut the queue, drain in-flight workers, release informers.
    pub async fn stop(mut self) {
        *self.inner.phase.lock().unwrap() = Phase::Stopping;
        info!(ctrl = %self.inner.key, "watch controller stopping");
        if let Some(t) = self.resync.take() {
            t.abort();
        }
        self.inner.queue.shut_down();
        if let Some(runner) = self.runner.take() {
            let _ = runner.await;
        }
        self.inner.factory.release(&self.inner.watched.meta);
        for a in &self.inner.attachments {
            self.inner.factory.release(&a.resolved.meta);
        }
        *self.inner.phase.lock().unwrap() = Phase::Stopped;
        info!(ctrl = %self.inner.key, "watch controller stopped");
    }
}

async fn run(inner: Arc<Inner>, worker_count: usize) {
    let deadline = cache_sync_timeout();
    let synced = async {
        inner.watched.informer.wait_for_sync(deadline).await?;
        for a in &inner.attachments {
            a.resolved.informer.wait_for_sync(deadline).await?;
        }
        Ok::<(), anyhow::Error>(())
    };
    tokio::select! {
        _ = inner.queue.closed() => return,
        res = synced => {
            if let Err(e) = res {
                error!(ctrl = %inner.key, error = %e, "informer caches never synced; controller idle");
                return;
            }
        }
    }
    *inner.phase.lock().unwrap() = Phase::Running;
    debug!(ctrl = %inner.key, "caches synced; workers starting");

    let mut workers = tokio::task::JoinSet::new();
    for worker in 0..worker_count {
        let inner = Arc::clone(&inner);
        workers.spawn(worker_loop(inner, worker));
    }
    while workers.join_next().await.is_some() {}
}

fn spawn_resync(inner: Arc<Inner>) -> Option<tokio::task::JoinHandle<()>> {
    let secs = u64::from(inner.ctrl.spec.resync_period_seconds?);
    if secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let keys = inner.watched.informer.store().keys();
            debug!(ctrl = %inner.key, count = keys.len(), "periodic resync enqueue");
            for key in keys {
                inner.queue.add(key);
            }
        }
    }))
}

async fn worker_loop(inner: Arc<Inner>, worker: usize) {
    while let Some(key) = inner.queue.get().await {
        let started = Instant::now();
        counter!("reconcile_total", 1u64);
        let outcome = AssertUnwindSafe(reconcile_key(&inner, &key))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => inner.queue.forget(&key),
            Ok(Err(e)) => {
                counter!("reconcile_errors_total", 1u64);
                warn!(ctrl = %inner.key, worker, key = %key, error = %e, "reconcile failed; will retry");
                inner.queue.add_rate_limited(key.clone());
            }
            Err(_) => {
                counter!("reconcile_panics_total", 1u64);
                error!(ctrl = %inner.key, worker, key = %key, "reconcile panicked; will retry");
                inner.queue.add_rate_limited(key.clone());
            }
        }
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        inner.queue.done(&key);
    }
}

async fn reconcile_key(inner: &Inner, key: &str) -> Result<()> {
    let Some(watched) = inner.watched.informer.store().get(key) else {
        // gone; owned attachments fall to owner-reference garbage collection
        debug!(ctrl = %inner.key, key = %key, "watched object absent; nothing to do");
        return Ok(());
    };

    let listings: Vec<(&ResourceRule, Vec<Arc<Value>>)> = inner
        .attachments
        .iter()
        .map(|a| (&a.rule, a.resolved.informer.store().list()))
        .collect();
    let owned = owned_attachments(&inner.ctrl, &inner.anno_key, &watched, &listings);

    if raw::has_deletion_timestamp(&watched) {
        return finalize(inner, key, &watched, owned).await;
    }

    if inner.ctrl.spec.hooks.finalize.is_some()
        && !raw::finalizers(&watched).iter().any(|f| f == &inner.finalizer)
    {
        set_finalizers(inner, &watched, true).await?;
    }

    let hook = inner
        .ctrl
        .spec
        .hooks
        .sync
        .as_ref()
        .ok_or_else(|| anyhow!("sync hook vanished"))?;
    let request = build_request(&inner.ctrl, &watched, &owned, false)?;
    let Some(response) = invoke(inner, hook, &request, &watched, key).await? else {
        return Ok(());
    };

    let ops = plan_ops(&inner.ctrl, &inner.anno_key, &watched, &owned, &response.attachments)?;
    execute_ops(inner, ops).await?;

    if let Some(status) = &response.status {
        patch_watched_status(inner, &watched, status).await?;
    }
    requeue_after(inner, key, &response);
    Ok(())
}

async fn finalize(inner: &Inner, key: &str, watched: &Value, owned: Vec<Arc<Value>>) -> Result<()> {
    let Some(hook) = &inner.ctrl.spec.hooks.finalize else {
        // nothing to run; release the object once nothing is owned
        if owned.is_empty() {
            remove_finalizer_if_held(inner, watched).await?;
        }
        return Ok(());
    };

    let request = build_request(&inner.ctrl, watched, &owned, true)?;
    let Some(response) = invoke(inner, hook, &request, watched, key).await? else {
        return Ok(());
    };

    let ops = plan_ops(&inner.ctrl, &inner.anno_key, watched, &owned, &response.attachments)?;
    execute_ops(inner, ops).await?;

    if finalize_outcome(response.finalized, response.attachments.len()) == FinalizeOutcome::Release {
        remove_finalizer_if_held(inner, watched).await?;
    }
    requeue_after(inner, key, &response);
    Ok(())
}

/// Call a hook. `Ok(None)` means the hook rejected the request for good:
/// logged, reflected in status, and not retried until a new event arrives.
async fn invoke(
    inner: &Inner,
    hook: &Hook,
    request: &metak_hooks::HookRequest,
    watched: &Value,
    key: &str,
) -> Result<Option<HookResponse>> {
    match inner.invoker.call(hook, request).await {
        Ok(response) => Ok(Some(response)),
        Err(e) if !e.is_retriable() => {
            counter!("hook_rejections_total", 1u64);
            error!(ctrl = %inner.key, key = %key, error = %e, "hook rejected request; waiting for new events");
            record_rejection(inner, watched, &e.to_string()).await;
            Ok(None)
        }
        Err(e) => Err(anyhow::Error::new(e).context("invoking hook")),
    }
}

/// Best-effort note on the watched object's status when a hook rejects the
/// request permanently.
async fn record_rejection(inner: &Inner, watched: &Value, message: &str) {
    let status = serde_json::json!({ "error": message });
    if let Err(e) = patch_watched_status(inner, watched, &status).await {
        debug!(ctrl = %inner.key, error = %e, "could not record hook rejection in status");
    }
}

fn requeue_after(inner: &Inner, key: &str, response: &HookResponse) {
    if let Some(secs) = response.resync_after_seconds {
        if secs > 0.0 {
            inner
                .queue
                .add_after(key.to_string(), Duration::from_secs_f64(secs));
        }
    }
}

fn api_for(inner: &Inner, meta: &ApiMeta, namespace: Option<&str>) -> Api<DynamicObject> {
    if meta.namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(inner.client.clone(), ns, &meta.resource),
            None => Api::all_with(inner.client.clone(), &meta.resource),
        }
    } else {
        Api::all_with(inner.client.clone(), &meta.resource)
    }
}

async fn execute_ops(inner: &Inner, ops: Vec<Op>) -> Result<()> {
    let flags = inner.ctrl.effective_operations();
    let mut first_err: Option<anyhow::Error> = None;
    let mut fail = |err: anyhow::Error| {
        counter!("attachment_op_errors_total", 1u64);
        if first_err.is_some() {
            warn!(error = %err, "additional attachment operation failure");
        } else {
            first_err = Some(err);
        }
    };

    for op in ops {
        match op {
            Op::Delete { id, .. } => {
                if !flags.delete_enabled() {
                    debug!(id = %id, "delete disabled by definition; skipping");
                    continue;
                }
                let meta = match inner.metas_by_type.get(&id.type_key) {
                    Some(m) => m,
                    None => {
                        fail(anyhow!("no resolved type for {}", id));
                        continue;
                    }
                };
                let (ns, name) = metak_core::split_key(&id.object_key);
                let api = api_for(inner, meta, ns);
                debug!(ctrl = %inner.key, id = %id, "deleting attachment");
                counter!("attachment_deletes_total", 1u64);
                if let Err(e) = api.delete(name, &DeleteParams::default()).await {
                    fail(anyhow::Error::new(e).context(format!("deleting {}", id)));
                }
            }
            Op::Create { id, obj } => {
                if !flags.create_enabled() {
                    debug!(id = %id, "create disabled by definition; skipping");
                    continue;
                }
                let meta = match inner.metas_by_type.get(&id.type_key) {
                    Some(m) => m,
                    None => {
                        fail(anyhow!("no resolved type for {}", id));
                        continue;
                    }
                };
                let (ns, _) = metak_core::split_key(&id.object_key);
                let api = api_for(inner, meta, ns);
                debug!(ctrl = %inner.key, id = %id, "creating attachment");
                counter!("attachment_creates_total", 1u64);
                let result = serde_json::from_value::<DynamicObject>(obj)
                    .context("decoding desired attachment")
                    .map(|dyn_obj| (api, dyn_obj));
                match result {
                    Ok((api, dyn_obj)) => {
                        if let Err(e) = api.create(&PostParams::default(), &dyn_obj).await {
                            fail(anyhow::Error::new(e).context(format!("creating {}", id)));
                        }
                    }
                    Err(e) => fail(e),
                }
            }
            Op::Update { id, merged, .. } => {
                if !flags.update_enabled() {
                    debug!(id = %id, "update disabled by definition; skipping");
                    continue;
                }
                let meta = match inner.metas_by_type.get(&id.type_key) {
                    Some(m) => m,
                    None => {
                        fail(anyhow!("no resolved type for {}", id));
                        continue;
                    }
                };
                let (ns, name) = metak_core::split_key(&id.object_key);
                let api = api_for(inner, meta, ns);
                debug!(ctrl = %inner.key, id = %id, "updating attachment");
                counter!("attachment_updates_total", 1u64);
                match serde_json::from_value::<DynamicObject>(merged)
                    .context("decoding merged attachment")
                {
                    // replace carries the live resourceVersion, so a
                    // conflicting write fails and the key retries
                    Ok(dyn_obj) => {
                        if let Err(e) = api.replace(name, &PostParams::default(), &dyn_obj).await {
                            fail(anyhow::Error::new(e).context(format!("updating {}", id)));
                        }
                    }
                    Err(e) => fail(e),
                }
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn patch_watched_status(inner: &Inner, watched: &Value, status: &Value) -> Result<()> {
    let name = raw::name(watched).ok_or_else(|| anyhow!("watched missing name"))?;
    let api = api_for(inner, &inner.watched.meta, raw::namespace(watched));
    let patch = serde_json::json!({ "status": status });
    if inner.watched.meta.has_status {
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context("patching watched status subresource")?;
    } else {
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context("patching watched status")?;
    }
    Ok(())
}

/// Add or remove this controller's finalizer on the watched object via a
/// merge patch of the full finalizer list.
async fn set_finalizers(inner: &Inner, watched: &Value, add: bool) -> Result<()> {
    let name = raw::name(watched).ok_or_else(|| anyhow!("watched missing name"))?;
    let mut finalizers = raw::finalizers(watched);
    if add {
        finalizers.push(inner.finalizer.clone());
    } else {
        finalizers.retain(|f| f != &inner.finalizer);
    }
    let api = api_for(inner, &inner.watched.meta, raw::namespace(watched));
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .with_context(|| format!("patching finalizers on {}", name))?;
    debug!(ctrl = %inner.key, object = %name, add, "finalizer patched");
    Ok(())
}

async fn remove_finalizer_if_held(inner: &Inner, watched: &Value) -> Result<()> {
    if raw::finalizers(watched).iter().any(|f| f == &inner.finalizer) {
        set_finalizers(inner, watched, false).await?;
    }
    Ok(())
}
