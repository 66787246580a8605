//! Three-way merge. Desired wins where it speaks; fields present in
//! last-applied but dropped from desired are relinquished; everything else
//! stays with the live object.

use serde_json::{Map, Value};

/// Merge `desired` into `live`, using `last` to tell which live fields this
/// controller owns. `live` absent (first create) yields `desired` as-is.
pub fn three_way_merge(last: Option<&Value>, live: Option<&Value>, desired: &Value) -> Value {
    match live {
        Some(live) => merge(live, last.unwrap_or(&Value::Null), desired, ""),
        None => desired.clone(),
    }
}

fn merge(live: &Value, last: &Value, desired: &Value, field: &str) -> Value {
    match (live, desired) {
        (Value::Object(lv), Value::Object(dv)) => merge_maps(lv, last.as_object(), dv),
        (Value::Array(lv), Value::Array(dv)) => {
            let la = last.as_array();
            match list_merge_keys(field, lv, la, dv) {
                Some(keys) => merge_keyed_lists(lv, la, dv, keys),
                // atomic
                None => desired.clone(),
            }
        }
        _ => desired.clone(),
    }
}

fn merge_maps(live: &Map<String, Value>, last: Option<&Map<String, Value>>, desired: &Map<String, Value>) -> Value {
    let mut out = live.clone();
    if let Some(last) = last {
        for k in last.keys() {
            if !desired.contains_key(k) {
                out.remove(k);
            }
        }
    }
    for (k, dv) in desired {
        let merged = match live.get(k) {
            Some(lv) => merge(
                lv,
                last.and_then(|m| m.get(k)).unwrap_or(&Value::Null),
                dv,
                k,
            ),
            None => dv.clone(),
        };
        out.insert(k.clone(), merged);
    }
    Value::Object(out)
}

/// Patch merge keys for well-known built-in list fields, keyed by the field
/// holding the list. Fields not declared here fall back to merging by
/// "name" when every element carries one; otherwise the list is atomic.
fn declared_merge_keys(field: &str) -> &'static [&'static str] {
    match field {
        "containers" | "initContainers" | "ephemeralContainers" | "volumes" | "env"
        | "imagePullSecrets" => &["name"],
        "ports" => &["containerPort", "protocol"],
        "volumeMounts" => &["mountPath"],
        "volumeDevices" => &["devicePath"],
        "hostAliases" => &["ip"],
        "ownerReferences" => &["uid"],
        _ => &[],
    }
}

/// Server-side defaults applied when building an element's merge key, so a
/// hook omitting them still matches the defaulted live state.
fn merge_key_default(key: &str) -> Option<&'static str> {
    match key {
        "protocol" => Some("TCP"),
        _ => None,
    }
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The composite merge key of one element; None when the element is not an
/// object carrying the leading key field.
fn elem_key(v: &Value, keys: &[&str]) -> Option<String> {
    let mut parts = Vec::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        match v.get(*key).and_then(scalar_string) {
            Some(s) => parts.push(s),
            None if i == 0 => return None,
            None => parts.push(merge_key_default(key).unwrap_or("").to_string()),
        }
    }
    Some(parts.join("/"))
}

/// Decide whether this list merges element-wise and by which keys: the
/// declared keys for the field, or the "name" fallback, provided every
/// element across all three inputs resolves a key.
fn list_merge_keys(
    field: &str,
    live: &[Value],
    last: Option<&Vec<Value>>,
    desired: &[Value],
) -> Option<&'static [&'static str]> {
    let declared = declared_merge_keys(field);
    let keys: &'static [&'static str] = if declared.is_empty() { &["name"] } else { declared };
    let mut any = false;
    for v in live
        .iter()
        .chain(last.into_iter().flatten())
        .chain(desired.iter())
    {
        if elem_key(v, keys).is_none() {
            return None;
        }
        any = true;
    }
    if any {
        Some(keys)
    } else {
        None
    }
}

fn merge_keyed_lists(
    live: &[Value],
    last: Option<&Vec<Value>>,
    desired: &[Value],
    keys: &[&str],
) -> Value {
    let find = |arr: Option<&[Value]>, wanted: &str| -> Option<Value> {
        arr.and_then(|a| {
            a.iter()
                .find(|v| elem_key(v, keys).as_deref() == Some(wanted))
                .cloned()
        })
    };
    let last_arr: Option<&[Value]> = last.map(|v| v.as_slice());

    let mut out = Vec::new();
    let mut matched: Vec<String> = Vec::new();
    for lv in live {
        let Some(k) = elem_key(lv, keys) else { continue };
        if let Some(dv) = find(Some(desired), &k) {
            let la = find(last_arr, &k).unwrap_or(Value::Null);
            out.push(merge(lv, &la, &dv, ""));
            matched.push(k);
        } else if find(last_arr, &k).is_some() {
            // owned previously, dropped from desired
        } else {
            out.push(lv.clone());
        }
    }
    for dv in desired {
        let Some(k) = elem_key(dv, keys) else { continue };
        if !matched.iter().any(|m| m == &k) {
            out.push(dv.clone());
        }
    }
    Value::Array(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_create_passes_desired_through() {
        let desired = json!({"spec": {"a": 1}});
        assert_eq!(three_way_merge(None, None, &desired), desired);
    }

    #[test]
    fn desired_wins_over_live() {
        let live = json!({"spec": {"image": "v1", "replicas": 2}});
        let desired = json!({"spec": {"image": "v2"}});
        let merged = three_way_merge(None, Some(&live), &desired);
        assert_eq!(merged["spec"]["image"], json!("v2"));
        // replicas was never ours; preserved
        assert_eq!(merged["spec"]["replicas"], json!(2));
    }

    #[test]
    fn fields_dropped_from_desired_are_cleared() {
        let last = json!({"spec": {"image": "v1", "limit": 5}});
        let live = json!({"spec": {"image": "v1", "limit": 5, "extra": true}});
        let desired = json!({"spec": {"image": "v1"}});
        let merged = three_way_merge(Some(&last), Some(&live), &desired);
        assert_eq!(merged["spec"]["image"], json!("v1"));
        assert!(merged["spec"].get("limit").is_none());
        // extra belongs to someone else
        assert_eq!(merged["spec"]["extra"], json!(true));
    }

    #[test]
    fn live_only_fields_survive_untouched() {
        let live = json!({
            "metadata": {"name": "p", "labels": {"cluster": "injected"}},
            "spec": {"nodeName": "node-7"}
        });
        let desired = json!({"metadata": {"name": "p"}, "spec": {}});
        let merged = three_way_merge(None, Some(&live), &desired);
        assert_eq!(merged["metadata"]["labels"]["cluster"], json!("injected"));
        assert_eq!(merged["spec"]["nodeName"], json!("node-7"));
    }

    #[test]
    fn plain_lists_are_atomic() {
        let live = json!({"spec": {"args": ["a", "b", "c"]}});
        let desired = json!({"spec": {"args": ["x"]}});
        let merged = three_way_merge(None, Some(&live), &desired);
        assert_eq!(merged["spec"]["args"], json!(["x"]));
    }

    #[test]
    fn named_lists_merge_by_name() {
        let last = json!({"spec": {"containers": [
            {"name": "app", "image": "v1"},
            {"name": "old-sidecar", "image": "s1"}
        ]}});
        let live = json!({"spec": {"containers": [
            {"name": "app", "image": "v1", "imagePullPolicy": "IfNotPresent"},
            {"name": "old-sidecar", "image": "s1"},
            {"name": "injected", "image": "mesh"}
        ]}});
        let desired = json!({"spec": {"containers": [
            {"name": "app", "image": "v2"}
        ]}});
        let merged = three_way_merge(Some(&last), Some(&live), &desired);
        let containers = merged["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        // app: desired image, live-only field preserved
        assert_eq!(containers[0]["name"], json!("app"));
        assert_eq!(containers[0]["image"], json!("v2"));
        assert_eq!(containers[0]["imagePullPolicy"], json!("IfNotPresent"));
        // old-sidecar relinquished, injected preserved
        assert_eq!(containers[1]["name"], json!("injected"));
    }

    #[test]
    fn named_list_appends_new_desired_elements() {
        let live = json!({"spec": {"containers": [{"name": "app", "image": "v1"}]}});
        let desired = json!({"spec": {"containers": [
            {"name": "app", "image": "v1"},
            {"name": "sidecar", "image": "s1"}
        ]}});
        let merged = three_way_merge(None, Some(&live), &desired);
        let containers = merged["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1]["name"], json!("sidecar"));
    }

    #[test]
    fn container_ports_merge_by_port_and_protocol() {
        // ports have no "name"; they key on containerPort+protocol
        let last = json!({"ports": [{"containerPort": 8080}]});
        let live = json!({"ports": [
            {"containerPort": 8080, "protocol": "TCP", "hostPort": 30080}
        ]});
        let desired = json!({"ports": [{"containerPort": 8080}]});
        let merged = three_way_merge(Some(&last), Some(&live), &desired);
        let ports = merged["ports"].as_array().unwrap();
        assert_eq!(ports.len(), 1);
        // matched despite the server-defaulted protocol; hostPort preserved
        assert_eq!(ports[0]["protocol"], json!("TCP"));
        assert_eq!(ports[0]["hostPort"], json!(30080));
    }

    #[test]
    fn stable_port_list_is_not_replaced_atomically() {
        let desired = json!({"ports": [
            {"containerPort": 8080},
            {"containerPort": 9090, "protocol": "UDP"}
        ]});
        let live = json!({"ports": [
            {"containerPort": 8080, "protocol": "TCP"},
            {"containerPort": 9090, "protocol": "UDP"}
        ]});
        let merged = three_way_merge(Some(&desired), Some(&live), &desired);
        assert_eq!(merged, live);
    }

    #[test]
    fn volume_mounts_merge_by_mount_path() {
        let live = json!({"volumeMounts": [
            {"mountPath": "/data", "name": "data", "readOnly": true},
            {"mountPath": "/var/run/injected", "name": "mesh-socket"}
        ]});
        let desired = json!({"volumeMounts": [
            {"mountPath": "/data", "name": "data-v2"}
        ]});
        let merged = three_way_merge(None, Some(&live), &desired);
        let mounts = merged["volumeMounts"].as_array().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0]["name"], json!("data-v2"));
        assert_eq!(mounts[0]["readOnly"], json!(true));
        assert_eq!(mounts[1]["name"], json!("mesh-socket"));
    }

    #[test]
    fn owner_references_merge_by_uid() {
        let last = json!({"metadata": {"ownerReferences": [
            {"apiVersion": "v1", "kind": "Thing", "name": "t1", "uid": "u-ours"}
        ]}});
        let live = json!({"metadata": {"ownerReferences": [
            {"apiVersion": "v1", "kind": "Thing", "name": "t1", "uid": "u-ours"},
            {"apiVersion": "v1", "kind": "Other", "name": "o1", "uid": "u-foreign"}
        ]}});
        let desired = last.clone();
        let merged = three_way_merge(Some(&last), Some(&live), &desired);
        let refs = merged["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1]["uid"], json!("u-foreign"));
    }

    #[test]
    fn idempotent_on_stable_desired() {
        let desired = json!({
            "metadata": {"name": "p", "labels": {"owner": "t1"}},
            "spec": {"containers": [{"name": "app", "image": "v2",
                                     "ports": [{"containerPort": 8080}]}]}
        });
        let live = three_way_merge(None, None, &desired);
        let again = three_way_merge(Some(&desired), Some(&live), &desired);
        assert_eq!(again, live);
    }
}
