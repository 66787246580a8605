//! The reconcile machinery: per-definition watch-controllers, the two
//! meta-controller supervisors that manage them, and the work queue both
//! layers run on.

#![forbid(unsafe_code)]

use anyhow::Result;
use tokio::sync::oneshot;

mod config;
mod crd;
mod map;
mod queue;
mod watch;

pub mod reconcile;

pub use config::{ConfigSupervisor, ConfigSupervisorBuilder, LoaderFn};
pub use crd::CrdSupervisor;
pub use map::ControllerMap;
pub use queue::{backoff_delay, RateLimitingQueue};
pub use watch::{Phase, WatchController};

/// The lifecycle surface shared by the CRD-driven and config-driven
/// supervisors. `start` returns a completion channel that resolves when the
/// supervisor's own loop ends: after `stop`, or with the fatal error that
/// aborted it.
#[async_trait::async_trait]
pub trait Supervisor: Send {
    fn start(&mut self) -> oneshot::Receiver<Result<()>>;
    async fn stop(&mut self);
}
