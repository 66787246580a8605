//! Pure reconcile planning: which attachments a watched object owns, what
//! the hook sees, and which create/update/delete operations bring the
//! cluster to the desired set. No I/O here; the watch-controller executes
//! the plan.

use anyhow::{anyhow, bail, Result};
use metak_apis::{GenericController, ResourceRule};
use metak_core::{raw, ObjectId};
use metak_hooks::HookRequest;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Label stamped on attachments when `generateSelector` is set.
pub const CONTROLLER_LABEL: &str = "metac.openebs.io/controller";

/// Finalizer this controller holds on watched objects while a finalize hook
/// is declared.
pub fn finalizer_name(flat_id: &str) -> String {
    format!("metac.openebs.io/{}", flat_id)
}

/// True when this attachment belongs to the given watched object under the
/// given definition: the ownership marker matches and an owner reference
/// points back at the watched object.
pub fn is_owned(
    ctrl: &GenericController,
    anno_key: &str,
    watched_uid: &str,
    attachment: &Value,
) -> bool {
    let marked = if ctrl.spec.generate_selector {
        raw::label(attachment, CONTROLLER_LABEL) == Some(ctrl.flat_id().as_str())
    } else {
        raw::annotation(attachment, anno_key).is_some()
    };
    if !marked {
        return false;
    }
    raw::owner_references_uids(attachment)
        .iter()
        .any(|u| u == watched_uid)
}

/// Collect the owned attachments of one watched object from informer
/// listings, applying each rule's selectors.
pub fn owned_attachments(
    ctrl: &GenericController,
    anno_key: &str,
    watched: &Value,
    listings: &[(&ResourceRule, Vec<Arc<Value>>)],
) -> Vec<Arc<Value>> {
    let Some(watched_uid) = raw::uid(watched) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (rule, objs) in listings {
        for obj in objs {
            if rule.matches(obj) && is_owned(ctrl, anno_key, watched_uid, obj) {
                out.push(Arc::clone(obj));
            }
        }
    }
    out
}

/// Shape the hook request envelope.
pub fn build_request(
    ctrl: &GenericController,
    watched: &Value,
    owned: &[Arc<Value>],
    finalizing: bool,
) -> Result<HookRequest> {
    let mut attachments: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for obj in owned {
        let id = ObjectId::from_raw(obj)
            .ok_or_else(|| anyhow!("owned attachment missing apiVersion/kind/name"))?;
        attachments
            .entry(id.type_key)
            .or_default()
            .insert(id.object_key, (**obj).clone());
    }
    Ok(HookRequest {
        controller: serde_json::to_value(ctrl)?,
        watched: watched.clone(),
        attachments,
        finalizing,
    })
}

/// One step of the apply plan, already ordered for execution.
#[derive(Debug)]
pub enum Op {
    Delete { id: ObjectId, current: Arc<Value> },
    Create { id: ObjectId, obj: Value },
    Update { id: ObjectId, current: Arc<Value>, merged: Value },
}

/// Decorate a desired attachment with the ownership markers: owner
/// reference to the watched object, the selector label when applicable, a
/// namespace defaulted from the watched object, and the last-applied
/// annotation.
fn decorate(
    ctrl: &GenericController,
    anno_key: &str,
    watched: &Value,
    desired: &Value,
) -> Result<Value> {
    if !desired.is_object() {
        bail!("desired attachment is not a JSON object: {}", desired);
    }
    let mut out = desired.clone();
    if raw::namespace(&out).is_none() {
        if let Some(ns) = raw::namespace(watched) {
            raw::set_namespace(&mut out, ns)?;
        }
    }
    let w_api = raw::api_version(watched).ok_or_else(|| anyhow!("watched missing apiVersion"))?;
    let w_kind = raw::kind(watched).ok_or_else(|| anyhow!("watched missing kind"))?;
    let w_name = raw::name(watched).ok_or_else(|| anyhow!("watched missing name"))?;
    let w_uid = raw::uid(watched).ok_or_else(|| anyhow!("watched missing uid"))?;
    raw::ensure_owner_reference(&mut out, w_api, w_kind, w_name, w_uid)?;
    if ctrl.spec.generate_selector {
        raw::set_label(&mut out, CONTROLLER_LABEL, &ctrl.flat_id())?;
    }
    let snapshot = out.clone();
    metak_apply::last_applied::set(&mut out, anno_key, &snapshot)?;
    Ok(out)
}

/// Diff the hook's desired set against the observed owned set. Deletes come
/// first (freeing names), then creates, then updates; updates are elided
/// when the merge changes nothing.
pub fn plan_ops(
    ctrl: &GenericController,
    anno_key: &str,
    watched: &Value,
    observed: &[Arc<Value>],
    desired: &[Value],
) -> Result<Vec<Op>> {
    let mut desired_by_id: BTreeMap<String, Value> = BTreeMap::new();
    for d in desired {
        let id = ObjectId::from_raw(&decorate(ctrl, anno_key, watched, d)?)
            .ok_or_else(|| anyhow!("desired attachment missing apiVersion/kind/name"))?;
        desired_by_id.insert(id.to_string(), d.clone());
    }

    let mut observed_by_id: BTreeMap<String, Arc<Value>> = BTreeMap::new();
    for o in observed {
        if let Some(id) = ObjectId::from_raw(o) {
            observed_by_id.insert(id.to_string(), Arc::clone(o));
        }
    }

    let mut deletes = Vec::new();
    let mut creates = Vec::new();
    let mut updates = Vec::new();

    for (id_str, current) in &observed_by_id {
        if !desired_by_id.contains_key(id_str) {
            let id = ObjectId::from_raw(current)
                .ok_or_else(|| anyhow!("observed attachment missing identity"))?;
            deletes.push(Op::Delete {
                id,
                current: Arc::clone(current),
            });
        }
    }

    for (id_str, d) in &desired_by_id {
        let stamped = decorate(ctrl, anno_key, watched, d)?;
        let id = ObjectId::from_raw(&stamped)
            .ok_or_else(|| anyhow!("desired attachment missing identity"))?;
        match observed_by_id.get(id_str) {
            None => creates.push(Op::Create { id, obj: stamped }),
            Some(current) => {
                let last = metak_apply::last_applied::get(current, anno_key)?;
                let mut merged = metak_apply::three_way_merge(
                    last.as_ref(),
                    Some(current.as_ref()),
                    &stamped,
                );
                metak_apply::last_applied::set(&mut merged, anno_key, &stamped)?;
                if !metak_apply::same_ignoring_server_fields(&merged, current) {
                    updates.push(Op::Update {
                        id,
                        current: Arc::clone(current),
                        merged,
                    });
                }
            }
        }
    }

    let mut ops = deletes;
    ops.extend(creates);
    ops.extend(updates);
    Ok(ops)
}

/// What the finalize path decided.
#[derive(Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Apply the plan, then drop the finalizer.
    Release,
    /// Apply the plan and keep waiting; the hook has not finished.
    KeepWaiting,
}

/// A finalize response releases the watched object only when the hook says
/// it is done and requests no attachments.
pub fn finalize_outcome(finalized: Option<bool>, desired_len: usize) -> FinalizeOutcome {
    if finalized == Some(true) && desired_len == 0 {
        FinalizeOutcome::Release
    } else {
        FinalizeOutcome::KeepWaiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctrl(generate_selector: bool) -> GenericController {
        serde_json::from_value(json!({
            "apiVersion": "metac.openebs.io/v1alpha1",
            "kind": "GenericController",
            "metadata": {"namespace": "team-a", "name": "thing-ctrl"},
            "spec": {
                "watch": {"apiVersion": "examples.metac.io/v1", "resource": "things"},
                "attachments": [{"apiVersion": "v1", "resource": "pods"}],
                "hooks": {"sync": {"webhook": {"url": "http://h/sync"}}},
                "generateSelector": generate_selector
            }
        }))
        .unwrap()
    }

    fn watched() -> Value {
        json!({
            "apiVersion": "examples.metac.io/v1",
            "kind": "Thing",
            "metadata": {"namespace": "ns1", "name": "t1", "uid": "u-thing"}
        })
    }

    #[test]
    fn finalizer_name_embeds_controller() {
        assert_eq!(
            finalizer_name("team-a-thing-ctrl"),
            "metac.openebs.io/team-a-thing-ctrl"
        );
    }

    #[test]
    fn ownership_requires_marker_and_back_reference() {
        let c = ctrl(false);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        let mut owned = json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {
                "namespace": "ns1", "name": "p",
                "annotations": {(key.as_str()): "{}"},
                "ownerReferences": [{"apiVersion": "examples.metac.io/v1", "kind": "Thing",
                                     "name": "t1", "uid": "u-thing"}]
            }
        });
        assert!(is_owned(&c, &key, "u-thing", &owned));
        // marker without back-reference
        owned["metadata"]["ownerReferences"] = json!([]);
        assert!(!is_owned(&c, &key, "u-thing", &owned));
        // back-reference without marker
        let unmarked = json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {
                "namespace": "ns1", "name": "p",
                "ownerReferences": [{"apiVersion": "examples.metac.io/v1", "kind": "Thing",
                                     "name": "t1", "uid": "u-thing"}]
            }
        });
        assert!(!is_owned(&c, &key, "u-thing", &unmarked));
    }

    #[test]
    fn ownership_via_generated_selector_label() {
        let c = ctrl(true);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        let obj = json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {
                "namespace": "ns1", "name": "p",
                "labels": {(CONTROLLER_LABEL): "team-a-thing-ctrl"},
                "ownerReferences": [{"apiVersion": "examples.metac.io/v1", "kind": "Thing",
                                     "name": "t1", "uid": "u-thing"}]
            }
        });
        assert!(is_owned(&c, &key, "u-thing", &obj));
        assert!(!is_owned(&c, &key, "other-uid", &obj));
    }

    #[test]
    fn create_plan_stamps_markers() {
        let c = ctrl(true);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        let desired = vec![json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": "t1-pod", "labels": {"owner": "t1"}},
            "spec": {"restartPolicy": "Never"}
        })];
        let ops = plan_ops(&c, &key, &watched(), &[], &desired).unwrap();
        assert_eq!(ops.len(), 1);
        let Op::Create { id, obj } = &ops[0] else {
            panic!("expected create, got {:?}", ops[0]);
        };
        assert_eq!(id.to_string(), "v1/Pod:ns1/t1-pod");
        // namespace defaulted from watched
        assert_eq!(raw::namespace(obj), Some("ns1"));
        assert_eq!(raw::label(obj, "owner"), Some("t1"));
        assert_eq!(raw::label(obj, CONTROLLER_LABEL), Some("team-a-thing-ctrl"));
        assert!(raw::annotation(obj, &key).is_some());
        assert_eq!(raw::owner_references_uids(obj), vec!["u-thing".to_string()]);
    }

    #[test]
    fn non_object_attachment_is_an_error_not_a_panic() {
        let c = ctrl(false);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        for bad in [json!("oops"), json!(42), json!(null), json!(["v1"])] {
            let err = plan_ops(&c, &key, &watched(), &[], &[bad]).unwrap_err();
            assert!(
                err.to_string().contains("not a JSON object"),
                "unexpected error: {}",
                err
            );
        }
    }

    fn live_from_create(c: &GenericController, key: &str, desired: &Value) -> Value {
        let ops = plan_ops(c, key, &watched(), &[], std::slice::from_ref(desired)).unwrap();
        let Op::Create { obj, .. } = &ops[0] else {
            panic!("expected create");
        };
        let mut live = obj.clone();
        live["metadata"]["uid"] = json!("u-pod");
        live["metadata"]["resourceVersion"] = json!("41");
        live
    }

    #[test]
    fn stable_desired_set_plans_nothing() {
        let c = ctrl(false);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        let desired = json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"namespace": "ns1", "name": "t1-pod"},
            "spec": {"restartPolicy": "Never"}
        });
        let live = live_from_create(&c, &key, &desired);
        let ops = plan_ops(&c, &key, &watched(), &[Arc::new(live)], &[desired]).unwrap();
        assert!(ops.is_empty(), "second reconcile must be a no-op: {:?}", ops);
    }

    #[test]
    fn user_drift_on_unowned_field_is_preserved() {
        let c = ctrl(false);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        let desired = json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"namespace": "ns1", "name": "t1-pod"},
            "spec": {}
        });
        let mut live = live_from_create(&c, &key, &desired);
        live["spec"]["image"] = json!("user-set");
        let ops = plan_ops(&c, &key, &watched(), &[Arc::new(live)], &[desired]).unwrap();
        assert!(ops.is_empty(), "unowned drift must not trigger writes: {:?}", ops);
    }

    #[test]
    fn drift_on_owned_field_is_repaired() {
        let c = ctrl(false);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        let desired = json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"namespace": "ns1", "name": "t1-pod"},
            "spec": {"image": "v2"}
        });
        let mut live = live_from_create(&c, &key, &desired);
        live["spec"]["image"] = json!("user-set");
        let ops = plan_ops(&c, &key, &watched(), &[Arc::new(live)], &[desired.clone()]).unwrap();
        assert_eq!(ops.len(), 1);
        let Op::Update { merged, .. } = &ops[0] else {
            panic!("expected update, got {:?}", ops[0]);
        };
        assert_eq!(merged["spec"]["image"], json!("v2"));
    }

    #[test]
    fn field_dropped_from_desired_is_cleared_by_one_update() {
        let c = ctrl(false);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        let original = json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"namespace": "ns1", "name": "t1-pod"},
            "spec": {"image": "v2", "limit": 5}
        });
        let live = live_from_create(&c, &key, &original);
        let trimmed = json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"namespace": "ns1", "name": "t1-pod"},
            "spec": {"image": "v2"}
        });
        let ops = plan_ops(&c, &key, &watched(), &[Arc::new(live)], &[trimmed]).unwrap();
        assert_eq!(ops.len(), 1);
        let Op::Update { merged, .. } = &ops[0] else {
            panic!("expected update, got {:?}", ops[0]);
        };
        assert!(merged["spec"].get("limit").is_none());
    }

    #[test]
    fn empty_desired_set_deletes_everything() {
        let c = ctrl(false);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        let a = live_from_create(
            &c,
            &key,
            &json!({"apiVersion": "v1", "kind": "Pod",
                    "metadata": {"namespace": "ns1", "name": "a"}}),
        );
        let b = live_from_create(
            &c,
            &key,
            &json!({"apiVersion": "v1", "kind": "Pod",
                    "metadata": {"namespace": "ns1", "name": "b"}}),
        );
        let observed = vec![Arc::new(a), Arc::new(b)];
        let ops = plan_ops(&c, &key, &watched(), &observed, &[]).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| matches!(op, Op::Delete { .. })));
    }

    #[test]
    fn deletes_come_before_creates() {
        let c = ctrl(false);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        let old = live_from_create(
            &c,
            &key,
            &json!({"apiVersion": "v1", "kind": "Pod",
                    "metadata": {"namespace": "ns1", "name": "old"}}),
        );
        let desired = vec![json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"namespace": "ns1", "name": "new"}
        })];
        let ops = plan_ops(&c, &key, &watched(), &[Arc::new(old)], &desired).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], Op::Delete { .. }));
        assert!(matches!(ops[1], Op::Create { .. }));
    }

    #[test]
    fn finalize_outcomes() {
        assert_eq!(finalize_outcome(Some(true), 0), FinalizeOutcome::Release);
        assert_eq!(finalize_outcome(Some(true), 1), FinalizeOutcome::KeepWaiting);
        assert_eq!(finalize_outcome(Some(false), 0), FinalizeOutcome::KeepWaiting);
        assert_eq!(finalize_outcome(None, 0), FinalizeOutcome::KeepWaiting);
    }

    #[test]
    fn request_envelope_groups_by_type_and_key() {
        let c = ctrl(false);
        let key = metak_apply::last_applied::annotation_key(&c.flat_id());
        let pod = Arc::new(json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"namespace": "ns1", "name": "t1-pod"}
        }));
        let req = build_request(&c, &watched(), &[pod], false).unwrap();
        assert!(!req.finalizing);
        assert!(req.attachments["v1/Pod"].contains_key("ns1/t1-pod"));
        assert_eq!(req.controller["metadata"]["name"], json!("thing-ctrl"));
    }
}
