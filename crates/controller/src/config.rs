//! Config-driven meta-controller supervisor: a static set of definitions,
//! loaded once, with a wait loop that keeps trying to start every
//! watch-controller until all run or the timeout expires.

use anyhow::{bail, Context, Result};
use kube::Client;
use metak_apis::GenericController;
use metak_discovery::ApiRegistry;
use metak_hooks::HookInvoker;
use metak_informer::InformerFactory;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::map::ControllerMap;
use crate::watch::WatchController;
use crate::Supervisor;

pub type LoaderFn = Box<dyn Fn() -> Result<Vec<GenericController>> + Send + Sync>;

/// Builder mirroring the two definition sources: a config path (which wins
/// when both are given) or a caller-supplied loader function.
pub struct ConfigSupervisorBuilder {
    config_path: Option<String>,
    loader: Option<LoaderFn>,
    worker_count: usize,
    wait_timeout: Duration,
    wait_interval: Duration,
}

impl Default for ConfigSupervisorBuilder {
    fn default() -> Self {
        Self {
            config_path: None,
            loader: None,
            worker_count: 1,
            wait_timeout: Duration::from_secs(30 * 60),
            wait_interval: Duration::from_secs(1),
        }
    }
}

impl ConfigSupervisorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn loader(mut self, loader: LoaderFn) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    /// Load the definitions now; duplicates by key are skipped, not merged.
    pub fn build(
        self,
        client: Client,
        registry: Arc<ApiRegistry>,
        factory: Arc<InformerFactory>,
        invoker: Arc<dyn HookInvoker>,
    ) -> Result<ConfigSupervisor> {
        let loaded = match (&self.config_path, &self.loader) {
            (Some(path), _) if !path.is_empty() => {
                metak_config::load(path).with_context(|| format!("loading config at {}", path))?
            }
            (_, Some(loader)) => loader().context("loading config from function")?,
            _ => bail!("config supervisor needs a config path or a loader function"),
        };

        let mut definitions: Vec<GenericController> = Vec::with_capacity(loaded.len());
        for ctrl in loaded {
            let key = ctrl.key();
            if definitions.iter().any(|c| c.key() == key) {
                warn!(key = %key, "duplicate definition; keeping the first");
                continue;
            }
            definitions.push(ctrl);
        }
        info!(definitions = definitions.len(), "config definitions loaded");

        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(ConfigSupervisor {
            client,
            registry,
            factory,
            invoker,
            worker_count: self.worker_count,
            wait_timeout: self.wait_timeout,
            wait_interval: self.wait_interval,
            definitions: Arc::new(definitions),
            stop_tx,
            stop_rx,
            runner: None,
        })
    }
}

pub struct ConfigSupervisor {
    client: Client,
    registry: Arc<ApiRegistry>,
    factory: Arc<InformerFactory>,
    invoker: Arc<dyn HookInvoker>,
    worker_count: usize,
    wait_timeout: Duration,
    wait_interval: Duration,
    definitions: Arc<Vec<GenericController>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    runner: Option<tokio::task::JoinHandle<()>>,
}

impl ConfigSupervisor {
    pub fn builder() -> ConfigSupervisorBuilder {
        ConfigSupervisorBuilder::new()
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }
}

#[async_trait::async_trait]
impl Supervisor for ConfigSupervisor {
    fn start(&mut self) -> oneshot::Receiver<Result<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        info!("config supervisor starting");
        let ctx = RunContext {
            client: self.client.clone(),
            registry: Arc::clone(&self.registry),
            factory: Arc::clone(&self.factory),
            invoker: Arc::clone(&self.invoker),
            worker_count: self.worker_count,
            wait_timeout: self.wait_timeout,
            wait_interval: self.wait_interval,
            definitions: Arc::clone(&self.definitions),
            stop_rx: self.stop_rx.clone(),
        };
        self.runner = Some(tokio::spawn(run(ctx, done_tx)));
        done_rx
    }

    async fn stop(&mut self) {
        info!("config supervisor stopping");
        let _ = self.stop_tx.send(true);
        if let Some(runner) = self.runner.take() {
            let _ = runner.await;
        }
        info!("config supervisor stopped");
    }
}

struct RunContext {
    client: Client,
    registry: Arc<ApiRegistry>,
    factory: Arc<InformerFactory>,
    invoker: Arc<dyn HookInvoker>,
    worker_count: usize,
    wait_timeout: Duration,
    wait_interval: Duration,
    definitions: Arc<Vec<GenericController>>,
    stop_rx: watch::Receiver<bool>,
}

async fn run(mut ctx: RunContext, done: oneshot::Sender<Result<()>>) {
    let started = Instant::now();
    let mut map = ControllerMap::new();

    // wait loop: keep trying to start everything until all are running
    loop {
        match start_missing(&ctx, &mut map) {
            Ok(()) => {
                info!(controllers = map.len(), "all watch controllers running");
                break;
            }
            Err(e) => {
                if started.elapsed() > ctx.wait_timeout {
                    let err = e.context(format!(
                        "config supervisor gave up after {:?}",
                        ctx.wait_timeout
                    ));
                    map.stop_all().await;
                    let _ = done.send(Err(err));
                    return;
                }
                warn!(error = %e, "not all controllers started; will retry");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(ctx.wait_interval) => {}
            _ = wait_for_stop(&mut ctx.stop_rx) => {
                map.stop_all().await;
                let _ = done.send(Ok(()));
                return;
            }
        }
    }

    wait_for_stop(&mut ctx.stop_rx).await;
    map.stop_all().await;
    let _ = done.send(Ok(()));
}

async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// One pass of the wait-loop condition: start whatever is not yet running.
/// The first failure aborts the pass; already-running controllers are kept.
fn start_missing(ctx: &RunContext, map: &mut ControllerMap) -> Result<()> {
    for ctrl in ctx.definitions.iter() {
        let key = ctrl.key();
        if map.contains(&key) {
            continue;
        }
        let mut controller = WatchController::new(
            ctx.client.clone(),
            &ctx.registry,
            Arc::clone(&ctx.factory),
            Arc::clone(&ctx.invoker),
            ctrl.clone(),
        )
        .with_context(|| format!("starting controller for {}", key))?;
        controller.start(ctx.worker_count);
        info!(key = %key, "watch controller started");
        map.insert(key, controller);
    }
    Ok(())
}
