//! Metak core vocabulary: object keys, GVK keys, and accessors over raw
//! (schema-less) Kubernetes objects.

#![forbid(unsafe_code)]

use serde_json::Value;

pub mod raw;

/// Join a namespace and name into a cache key. Cluster-scoped objects
/// (empty namespace) key by bare name.
pub fn join_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Split a cache key back into (namespace, name). Keys without a slash are
/// cluster-scoped.
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() => (Some(ns), name),
        Some((_, name)) => (None, name),
        None => (None, key),
    }
}

/// Group key for a resource type, e.g. "apps/v1/Deployment" or "v1/Pod".
pub fn gvk_key(api_version: &str, kind: &str) -> String {
    format!("{}/{}", api_version, kind)
}

/// Split an apiVersion into (group, version); core-group versions have an
/// empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Typed identity of an object inside one controller: type key + object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    /// "apiVersion/kind"
    pub type_key: String,
    /// "namespace/name" (or bare name)
    pub object_key: String,
}

impl ObjectId {
    pub fn from_raw(obj: &Value) -> Option<Self> {
        let api_version = raw::api_version(obj)?;
        let kind = raw::kind(obj)?;
        let name = raw::name(obj)?;
        Some(Self {
            type_key: gvk_key(api_version, kind),
            object_key: join_key(raw::namespace(obj), name),
        })
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.type_key, self.object_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_round_trip() {
        assert_eq!(join_key(Some("ns1"), "t1"), "ns1/t1");
        assert_eq!(join_key(None, "t1"), "t1");
        assert_eq!(join_key(Some(""), "t1"), "t1");
        assert_eq!(split_key("ns1/t1"), (Some("ns1"), "t1"));
        assert_eq!(split_key("t1"), (None, "t1"));
        assert_eq!(split_key("/t1"), (None, "t1"));
    }

    #[test]
    fn api_version_split() {
        assert_eq!(parse_api_version("v1"), ("".to_string(), "v1".to_string()));
        assert_eq!(
            parse_api_version("apps/v1"),
            ("apps".to_string(), "v1".to_string())
        );
    }

    #[test]
    fn object_id_from_raw() {
        let obj = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"namespace": "ns1", "name": "t1-pod"}
        });
        let id = ObjectId::from_raw(&obj).unwrap();
        assert_eq!(id.type_key, "v1/Pod");
        assert_eq!(id.object_key, "ns1/t1-pod");
        assert_eq!(id.to_string(), "v1/Pod:ns1/t1-pod");
    }
}
