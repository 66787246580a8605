//! Apply engine: pure three-way merge of (last-applied, live, desired) raw
//! objects, structural equality that ignores server-assigned fields, and the
//! last-applied annotation codec.

#![forbid(unsafe_code)]

use serde_json::Value;

mod merge;

pub mod last_applied;

pub use merge::three_way_merge;

/// Fields the API server owns; both sides are stripped of these before any
/// "did anything change" comparison.
const SERVER_META_FIELDS: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
];

fn prune_server_fields(v: &Value) -> Value {
    let mut out = v.clone();
    if let Some(meta) = out.get_mut("metadata").and_then(Value::as_object_mut) {
        for f in SERVER_META_FIELDS {
            meta.remove(*f);
        }
    }
    if let Some(obj) = out.as_object_mut() {
        obj.remove("status");
    }
    out
}

/// Structural equality modulo server-assigned metadata and status. Used to
/// decide whether a merged object actually needs an update call.
pub fn same_ignoring_server_fields(a: &Value, b: &Value) -> bool {
    prune_server_fields(a) == prune_server_fields(b)
}
