//! Hook client: JSON request/response envelopes and the webhook transport
//! that delivers observed state to user logic and brings desired state back.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use metak_apis::Hook;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Observed state shipped to a sync/finalize hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequest {
    /// The GenericController definition driving this reconcile.
    pub controller: Value,
    /// The watched object as observed.
    pub watched: Value,
    /// Owned attachments: "{apiVersion}/{kind}" -> "{ns}/{name}" -> object.
    pub attachments: BTreeMap<String, BTreeMap<String, Value>>,
    pub finalizing: bool,
}

/// Desired state returned by a hook. `attachments` is the complete desired
/// set; anything observed but not listed is deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,

    #[serde(default)]
    pub attachments: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_after_seconds: Option<f64>,
}

#[derive(Debug, Error)]
pub enum HookError {
    /// Connection or timeout trouble before a response arrived.
    #[error("hook transport: {0}")]
    Transport(String),

    /// Non-2xx response.
    #[error("hook returned {code}: {body}")]
    Status { code: u16, body: String },

    /// 2xx but the body did not parse as a response envelope.
    #[error("hook response malformed: {0}")]
    Malformed(String),
}

impl HookError {
    /// Transport trouble and server-side errors are worth retrying; a 4xx is
    /// the hook rejecting this request for good (408/429 excepted).
    pub fn is_retriable(&self) -> bool {
        match self {
            HookError::Transport(_) => true,
            HookError::Status { code, .. } => !(400..500).contains(code) || matches!(*code, 408 | 429),
            HookError::Malformed(_) => true,
        }
    }
}

/// Seam between the reconciler and the wire, so reconcile logic is testable
/// without HTTP.
#[async_trait]
pub trait HookInvoker: Send + Sync {
    async fn call(&self, hook: &Hook, request: &HookRequest) -> Result<HookResponse, HookError>;
}

fn default_timeout_secs() -> u64 {
    std::env::var("METAK_HOOK_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30)
}

const MAX_ERROR_BODY: usize = 1024;

/// HTTP POST invoker for webhook-backed hooks.
pub struct WebhookInvoker {
    client: reqwest::Client,
}

impl WebhookInvoker {
    pub fn new() -> Result<Self, HookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(default_timeout_secs()))
            .build()
            .map_err(|e| HookError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HookInvoker for WebhookInvoker {
    async fn call(&self, hook: &Hook, request: &HookRequest) -> Result<HookResponse, HookError> {
        let url = &hook.webhook.url;
        let started = Instant::now();
        counter!("hook_requests_total", 1u64);
        debug!(url = %url, finalizing = request.finalizing, "invoking hook");

        let mut builder = self.client.post(url).json(request);
        if let Some(secs) = hook.webhook.timeout_seconds {
            builder = builder.timeout(Duration::from_secs(u64::from(secs)));
        }
        let response = builder.send().await.map_err(|e| {
            counter!("hook_errors_total", 1u64);
            HookError::Transport(e.to_string())
        })?;

        let code = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| HookError::Transport(e.to_string()))?;
        histogram!("hook_latency_ms", started.elapsed().as_secs_f64() * 1000.0);

        if !(200..300).contains(&code) {
            counter!("hook_errors_total", 1u64);
            let mut body = body;
            body.truncate(MAX_ERROR_BODY);
            return Err(HookError::Status { code, body });
        }

        serde_json::from_str(&body).map_err(|e| {
            counter!("hook_errors_total", 1u64);
            HookError::Malformed(e.to_string())
        })
    }
}
