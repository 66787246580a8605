//! Read/write helpers over raw JSON objects. Hook payloads and the apply
//! path deal in `serde_json::Value`, so everything here is path-based.
//! Writers are fallible: hook-supplied values may not be objects at all.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

pub fn api_version(obj: &Value) -> Option<&str> {
    obj.get("apiVersion").and_then(Value::as_str)
}

pub fn kind(obj: &Value) -> Option<&str> {
    obj.get("kind").and_then(Value::as_str)
}

fn metadata(obj: &Value) -> Option<&Map<String, Value>> {
    obj.get("metadata").and_then(Value::as_object)
}

fn metadata_mut(obj: &mut Value) -> Result<&mut Map<String, Value>> {
    let root = obj
        .as_object_mut()
        .ok_or_else(|| anyhow!("not a JSON object"))?;
    root.entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| anyhow!("metadata is not a JSON object"))
}

pub fn name(obj: &Value) -> Option<&str> {
    metadata(obj)?.get("name").and_then(Value::as_str)
}

pub fn namespace(obj: &Value) -> Option<&str> {
    metadata(obj)?.get("namespace").and_then(Value::as_str)
}

pub fn uid(obj: &Value) -> Option<&str> {
    metadata(obj)?.get("uid").and_then(Value::as_str)
}

pub fn resource_version(obj: &Value) -> Option<&str> {
    metadata(obj)?.get("resourceVersion").and_then(Value::as_str)
}

pub fn has_deletion_timestamp(obj: &Value) -> bool {
    metadata(obj)
        .and_then(|m| m.get("deletionTimestamp"))
        .map(|v| !v.is_null())
        .unwrap_or(false)
}

pub fn labels(obj: &Value) -> Option<&Map<String, Value>> {
    metadata(obj)?.get("labels").and_then(Value::as_object)
}

pub fn annotations(obj: &Value) -> Option<&Map<String, Value>> {
    metadata(obj)?.get("annotations").and_then(Value::as_object)
}

pub fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    annotations(obj)?.get(key).and_then(Value::as_str)
}

pub fn label<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    labels(obj)?.get(key).and_then(Value::as_str)
}

pub fn finalizers(obj: &Value) -> Vec<String> {
    metadata(obj)
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn string_map_entry<'a>(
    meta: &'a mut Map<String, Value>,
    field: &str,
) -> Result<&'a mut Map<String, Value>> {
    meta.entry(field)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| anyhow!("metadata.{} is not a JSON object", field))
}

pub fn set_annotation(obj: &mut Value, key: &str, value: &str) -> Result<()> {
    let meta = metadata_mut(obj)?;
    string_map_entry(meta, "annotations")?
        .insert(key.to_string(), Value::String(value.to_string()));
    Ok(())
}

pub fn remove_annotation(obj: &mut Value, key: &str) {
    if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
        if let Some(ann) = meta.get_mut("annotations").and_then(Value::as_object_mut) {
            ann.remove(key);
        }
    }
}

pub fn set_label(obj: &mut Value, key: &str, value: &str) -> Result<()> {
    let meta = metadata_mut(obj)?;
    string_map_entry(meta, "labels")?.insert(key.to_string(), Value::String(value.to_string()));
    Ok(())
}

pub fn set_namespace(obj: &mut Value, namespace: &str) -> Result<()> {
    metadata_mut(obj)?.insert(
        "namespace".to_string(),
        Value::String(namespace.to_string()),
    );
    Ok(())
}

/// Append an owner reference unless one with the same uid already exists.
pub fn ensure_owner_reference(
    obj: &mut Value,
    api_version: &str,
    kind: &str,
    name: &str,
    uid: &str,
) -> Result<()> {
    let meta = metadata_mut(obj)?;
    let refs = meta
        .entry("ownerReferences")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| anyhow!("metadata.ownerReferences is not a JSON array"))?;
    let present = refs
        .iter()
        .any(|r| r.get("uid").and_then(Value::as_str) == Some(uid));
    if !present {
        refs.push(serde_json::json!({
            "apiVersion": api_version,
            "kind": kind,
            "name": name,
            "uid": uid,
            "controller": true,
            "blockOwnerDeletion": true,
        }));
    }
    Ok(())
}

/// The uids named by this object's owner references.
pub fn owner_references_uids(obj: &Value) -> Vec<String> {
    metadata(obj)
        .and_then(|m| m.get("ownerReferences"))
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(|r| Some(r.get("uid")?.as_str()?.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Owner references as (apiVersion, kind, name) triples.
pub fn owner_references(obj: &Value) -> Vec<(String, String, String)> {
    metadata(obj)
        .and_then(|m| m.get("ownerReferences"))
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(|r| {
                    Some((
                        r.get("apiVersion")?.as_str()?.to_string(),
                        r.get("kind")?.as_str()?.to_string(),
                        r.get("name")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}
