//! Resource Registry: resolves (apiVersion, resource) pairs to REST metadata
//! via kube Discovery, with an in-memory cache and periodic refresh.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use kube::core::ApiResource;
use kube::discovery::{Discovery, Scope};
use kube::Client;
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// REST metadata for one served resource type.
#[derive(Debug, Clone)]
pub struct ApiMeta {
    pub resource: ApiResource,
    pub namespaced: bool,
    pub has_status: bool,
}

impl ApiMeta {
    pub fn api_version(&self) -> String {
        if self.resource.group.is_empty() {
            self.resource.version.clone()
        } else {
            format!("{}/{}", self.resource.group, self.resource.version)
        }
    }
}

/// Cached view of server discovery. Lookups are keyed by
/// "{apiVersion}/{plural}" with "{apiVersion}/{kind}" as an alias, so
/// definitions may name either form.
pub struct ApiRegistry {
    client: Client,
    by_key: RwLock<FxHashMap<String, Arc<ApiMeta>>>,
}

fn refresh_interval_secs() -> u64 {
    std::env::var("METAK_DISCOVERY_REFRESH_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30)
}

impl ApiRegistry {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            by_key: RwLock::new(FxHashMap::default()),
        }
    }

    /// Run a full discovery sweep and replace the cache.
    pub async fn discover(&self) -> Result<usize> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut next: FxHashMap<String, Arc<ApiMeta>> = FxHashMap::default();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let has_status = caps
                    .subresources
                    .iter()
                    .any(|(sub, _)| sub.plural.ends_with("/status"));
                let meta = Arc::new(ApiMeta {
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                    has_status,
                    resource: ar.clone(),
                });
                next.insert(format!("{}/{}", meta.api_version(), ar.plural), meta.clone());
                // kind alias; plural wins on (unlikely) collision
                next.entry(format!("{}/{}", meta.api_version(), ar.kind))
                    .or_insert(meta);
            }
        }
        let count = next.len();
        *self.by_key.write().unwrap() = next;
        debug!(entries = count, "discovery cache refreshed");
        Ok(count)
    }

    /// Resolve a declared resource. Not-found is retriable: the type may be
    /// registered after this controller starts.
    pub fn resolve(&self, api_version: &str, resource: &str) -> Result<Arc<ApiMeta>> {
        self.by_key
            .read()
            .unwrap()
            .get(&format!("{}/{}", api_version, resource))
            .cloned()
            .ok_or_else(|| anyhow!("resource not served: {}/{}", api_version, resource))
    }

    /// Periodically re-sweep discovery so late-registered CRDs become
    /// resolvable. Runs until the handle is aborted.
    pub fn spawn_refresh(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let secs = refresh_interval_secs();
        info!(interval_secs = secs, "discovery refresh loop starting");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(secs.max(1)));
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if let Err(e) = registry.discover().await {
                    warn!(error = %e, "discovery refresh failed; keeping previous cache");
                }
            }
        })
    }

}
