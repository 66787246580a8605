//! Label/annotation selector matching. The same shape serves both
//! `labelSelector` and `annotationSelector` in a resource rule.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<Requirement>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl Selector {
    /// An empty selector matches every object.
    pub fn matches(&self, kv: &BTreeMap<String, String>) -> bool {
        if let Some(wanted) = &self.match_labels {
            for (k, v) in wanted {
                if kv.get(k) != Some(v) {
                    return false;
                }
            }
        }
        if let Some(exprs) = &self.match_expressions {
            for req in exprs {
                if !req.matches(kv) {
                    return false;
                }
            }
        }
        true
    }
}

impl Requirement {
    fn matches(&self, kv: &BTreeMap<String, String>) -> bool {
        let present = kv.get(&self.key);
        let values = self.values.as_deref().unwrap_or_default();
        match self.operator {
            Operator::In => matches!(present, Some(v) if values.iter().any(|x| x == v)),
            Operator::NotIn => match present {
                Some(v) => !values.iter().any(|x| x == v),
                None => true,
            },
            Operator::Exists => present.is_some(),
            Operator::DoesNotExist => present.is_none(),
        }
    }
}
