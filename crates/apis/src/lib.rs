//! GenericController custom resource types (metac.openebs.io/v1alpha1).
//!
//! A GenericController declares one watched resource kind, the attachment
//! kinds the controller may manage under it, and the webhooks that compute
//! desired state.

#![forbid(unsafe_code)]

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod selector;

pub use selector::Selector;

/// GenericControllerSpec declares what to watch, what may be attached, and
/// which hooks drive reconciliation.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "metac.openebs.io",
    version = "v1alpha1",
    kind = "GenericController",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GenericControllerSpec {
    /// The single resource kind this controller reconciles.
    pub watch: ResourceRule,

    /// Resource kinds the controller may create, update, or delete as
    /// children of a watched object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<ResourceRule>,

    pub hooks: Hooks,

    /// Forced re-enqueue interval for all watched objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_period_seconds: Option<u32>,

    /// Synthesize a per-controller ownership label and stamp it on every
    /// attachment.
    #[serde(default)]
    pub generate_selector: bool,

    /// Per-operation enable flags; absent means everything enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<OperationFlags>,
}

/// A resource kind plus optional narrowing selectors.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    /// e.g. "v1" or "apps/v1".
    pub api_version: String,

    /// Plural resource name ("deployments"); the kind is accepted too.
    pub resource: String,

    /// Restrict to these object names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_selector: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<Selector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_selector: Option<Selector>,
}

impl ResourceRule {
    /// True when the object's name, labels, and annotations all pass this
    /// rule's selectors. Absent selectors match everything.
    pub fn matches(&self, obj: &Value) -> bool {
        if let Some(names) = &self.name_selector {
            if !names.is_empty() {
                match metak_core::raw::name(obj) {
                    Some(n) if names.iter().any(|x| x == n) => {}
                    _ => return false,
                }
            }
        }
        if let Some(sel) = &self.label_selector {
            if !sel.matches(&string_map(metak_core::raw::labels(obj))) {
                return false;
            }
        }
        if let Some(sel) = &self.annotation_selector {
            if !sel.matches(&string_map(metak_core::raw::annotations(obj))) {
                return false;
            }
        }
        true
    }
}

fn string_map(m: Option<&serde_json::Map<String, Value>>) -> BTreeMap<String, String> {
    m.map(|m| {
        m.iter()
            .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
            .collect()
    })
    .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<Hook>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<Hook>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    pub webhook: Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
}

/// Which attachment operations the controller is allowed to perform.
/// Unset fields default to enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<bool>,
}

impl OperationFlags {
    pub fn create_enabled(&self) -> bool {
        self.create.unwrap_or(true)
    }
    pub fn update_enabled(&self) -> bool {
        self.update.unwrap_or(true)
    }
    pub fn delete_enabled(&self) -> bool {
        self.delete.unwrap_or(true)
    }
}

impl GenericController {
    /// "{namespace}/{name}" identity of this definition.
    pub fn key(&self) -> String {
        metak_core::join_key(
            self.metadata.namespace.as_deref(),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    /// Flattened "{ns}-{name}" form used in annotation/finalizer/label
    /// values, where slashes are not allowed.
    pub fn flat_id(&self) -> String {
        format!(
            "{}-{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Semantic spec equality: compare the serialized forms so that unset
    /// and default-valued optionals are indistinguishable.
    pub fn same_spec(&self, other: &GenericController) -> bool {
        serde_json::to_value(&self.spec).ok() == serde_json::to_value(&other.spec).ok()
    }

    pub fn effective_operations(&self) -> OperationFlags {
        self.spec.operations.clone().unwrap_or_default()
    }
}
