//! Last-applied annotation codec. Each attachment carries the canonical
//! serialization of the last desired state this controller produced for it;
//! the three-way merge reads it back as the "last" input.

use anyhow::{Context, Result};
use serde_json::Value;

/// Annotation key for a controller identified by its flattened
/// "{ns}-{name}" id.
pub fn annotation_key(flat_id: &str) -> String {
    format!("metac.{}/last-applied-config", flat_id)
}

/// Read and parse the stored last-applied state. A malformed payload is an
/// error (not silently treated as absent) so the caller can log and rebuild.
pub fn get(obj: &Value, key: &str) -> Result<Option<Value>> {
    match metak_core::raw::annotation(obj, key) {
        Some(text) => {
            let parsed = serde_json::from_str(text)
                .with_context(|| format!("parsing {} annotation", key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Stamp the canonical serialization of `desired` onto `obj`. The stored
/// copy excludes the annotation itself so the value stays stable across
/// round trips.
pub fn set(obj: &mut Value, key: &str, desired: &Value) -> Result<()> {
    let mut stored = desired.clone();
    metak_core::raw::remove_annotation(&mut stored, key);
    let text = serde_json::to_string(&stored).context("serializing last-applied state")?;
    metak_core::raw::set_annotation(obj, key, &text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_embeds_controller_id() {
        assert_eq!(
            annotation_key("team-a-thing-ctrl"),
            "metac.team-a-thing-ctrl/last-applied-config"
        );
    }

    #[test]
    fn set_then_get_round_trips() {
        let key = annotation_key("ns-c");
        let desired = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p", "labels": {"owner": "t1"}},
            "spec": {"x": 1}
        });
        let mut obj = desired.clone();
        set(&mut obj, &key, &desired).unwrap();
        let got = get(&obj, &key).unwrap().unwrap();
        assert_eq!(got, desired);
    }

    #[test]
    fn stored_value_excludes_itself() {
        let key = annotation_key("ns-c");
        let mut desired = json!({"metadata": {"name": "p"}});
        // simulate a hook echoing our annotation back
        metak_core::raw::set_annotation(&mut desired, &key, "stale").unwrap();
        let mut obj = json!({"metadata": {"name": "p"}});
        set(&mut obj, &key, &desired).unwrap();
        let stored = get(&obj, &key).unwrap().unwrap();
        assert!(metak_core::raw::annotation(&stored, &key).is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let key = annotation_key("ns-c");
        let mut obj = json!({"metadata": {"name": "p"}});
        metak_core::raw::set_annotation(&mut obj, &key, "{not json").unwrap();
        assert!(get(&obj, &key).is_err());
    }

    #[test]
    fn absent_annotation_is_none() {
        let obj = json!({"metadata": {"name": "p"}});
        assert!(get(&obj, &annotation_key("ns-c")).unwrap().is_none());
    }
}
