//! Typed accessors over schema-agnostic replicated objects.
//!
//! The engine never compiles per-kind code paths. Objects travel as
//! [`DynamicObject`]s and only the handful of fields replication touches are
//! read here: name, namespace, labels, the specification payload and the
//! status blob.

use crate::error::{ReplicatorError, ReplicatorResult};
use crate::resource::ResourceTypeDescriptor;
use kube::api::{DynamicObject, ObjectMeta, TypeMeta};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Marks an object as a local source of truth eligible for replication.
pub const LOCAL_ORIGIN_LABEL: &str = "replication.peering.io/local-origin";

/// Names the single peer cluster an object is mirrored to.
pub const DESTINATION_LABEL: &str = "replication.peering.io/destination-cluster";

/// Set on every mirror to the identifier of the cluster that owns it.
pub const ORIGIN_CLUSTER_LABEL: &str = "replication.peering.io/origin-cluster";

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Label selector for local replication sources.
pub fn local_origin_selector() -> String {
    format!("{}=true", LOCAL_ORIGIN_LABEL)
}

/// Label selector for local sources targeting one peer.
pub fn destination_selector(cluster_id: &str) -> String {
    format!(
        "{}=true,{}={}",
        LOCAL_ORIGIN_LABEL, DESTINATION_LABEL, cluster_id
    )
}

/// Label selector for mirrors created by `local_cluster_id` on a peer.
pub fn mirror_selector(local_cluster_id: &str) -> String {
    format!("{}={}", ORIGIN_CLUSTER_LABEL, local_cluster_id)
}

/// Name and namespace of an object. Mirrors share the key of their source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Build a key.
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Key of an object, scoped the way its kind is.
    pub fn of(rt: &ResourceTypeDescriptor, obj: &DynamicObject) -> ReplicatorResult<Self> {
        let name = obj
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ReplicatorError::MalformedObject {
                kind: rt.kind.clone(),
                name: "<unnamed>".to_string(),
                reason: "metadata.name is missing".to_string(),
            })?;

        let namespace = if rt.is_namespaced() {
            Some(obj.metadata.namespace.clone().ok_or_else(|| {
                ReplicatorError::MalformedObject {
                    kind: rt.kind.clone(),
                    name: name.clone(),
                    reason: "namespaced object has no metadata.namespace".to_string(),
                }
            })?)
        } else {
            None
        };

        Ok(Self { namespace, name })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Labels of an object (empty map if none).
pub fn labels(obj: &DynamicObject) -> BTreeMap<String, String> {
    obj.metadata.labels.clone().unwrap_or_default()
}

fn label<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// Whether the object carries `local-origin=true`.
pub fn is_local_origin(obj: &DynamicObject) -> bool {
    label(obj, LOCAL_ORIGIN_LABEL) == Some("true")
}

/// Whether the object is a mirror written by `local_cluster_id`.
pub fn is_mirror_of(obj: &DynamicObject, local_cluster_id: &str) -> bool {
    label(obj, ORIGIN_CLUSTER_LABEL) == Some(local_cluster_id)
}

/// Read the destination marker.
///
/// Returns `Ok(None)` while the marker is absent or empty: an object created
/// before its destination is set is a legitimate transient state and is
/// re-examined on every update.
pub fn destination(
    rt: &ResourceTypeDescriptor,
    obj: &DynamicObject,
    local_cluster_id: &str,
) -> ReplicatorResult<Option<String>> {
    let value = match label(obj, DESTINATION_LABEL) {
        None => return Ok(None),
        Some(v) if v.trim().is_empty() => return Ok(None),
        Some(v) => v,
    };

    let malformed = |reason: String| ReplicatorError::MalformedObject {
        kind: rt.kind.clone(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        reason,
    };

    if !is_valid_label_value(value) {
        return Err(malformed(format!(
            "destination marker '{}' is not a valid cluster identifier",
            value
        )));
    }
    if value == local_cluster_id {
        return Err(malformed(format!(
            "destination marker '{}' names the local cluster",
            value
        )));
    }

    Ok(Some(value.to_string()))
}

/// Kubernetes label value syntax: at most 63 characters of `[A-Za-z0-9._-]`,
/// starting and ending with an alphanumeric.
fn is_valid_label_value(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let alnum = |b: &u8| b.is_ascii_alphanumeric();
    alnum(&bytes[0])
        && alnum(&bytes[bytes.len() - 1])
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// The `spec` blob.
pub fn spec_of(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("spec")
}

/// The `status` blob.
pub fn status_of(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("status").filter(|s| !s.is_null())
}

/// Every top-level payload field except `status`.
///
/// Most kinds keep their desired state under `spec`, but some carry it in
/// other top-level fields, so the whole non-status payload is replicated.
pub fn payload_of(obj: &DynamicObject) -> Map<String, Value> {
    match &obj.data {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| k.as_str() != "status")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Map::new(),
    }
}

/// Build the desired mirror of a local object for a peer.
///
/// The source markers are replaced by the origin marker so the mirror is never
/// mistaken for a local-origin object on the peer. Status is not copied.
pub fn build_mirror(
    rt: &ResourceTypeDescriptor,
    local: &DynamicObject,
    local_cluster_id: &str,
) -> ReplicatorResult<DynamicObject> {
    let key = ObjectKey::of(rt, local)?;

    let mut mirror_labels = labels(local);
    mirror_labels.remove(LOCAL_ORIGIN_LABEL);
    mirror_labels.remove(DESTINATION_LABEL);
    mirror_labels.insert(
        ORIGIN_CLUSTER_LABEL.to_string(),
        local_cluster_id.to_string(),
    );

    let annotations = local.metadata.annotations.clone().map(|mut a| {
        a.remove(LAST_APPLIED_ANNOTATION);
        a
    });

    Ok(DynamicObject {
        types: Some(TypeMeta {
            api_version: rt.api_version(),
            kind: rt.kind.clone(),
        }),
        metadata: ObjectMeta {
            name: Some(key.name),
            namespace: key.namespace,
            labels: Some(mirror_labels),
            annotations: annotations.filter(|a| !a.is_empty()),
            ..Default::default()
        },
        data: Value::Object(payload_of(local)),
    })
}

/// Compute the replacement for an existing mirror, or `None` if it already
/// matches `desired`.
///
/// Only payload, labels and annotations change; the existing status and
/// resource version are carried so the write never touches remote-owned
/// status.
pub fn mirror_update(existing: &DynamicObject, desired: &DynamicObject) -> Option<DynamicObject> {
    let same_payload = payload_of(existing) == payload_of(desired);
    let same_labels = existing.metadata.labels == desired.metadata.labels;
    let same_annotations = existing.metadata.annotations.clone().unwrap_or_default()
        == desired.metadata.annotations.clone().unwrap_or_default();

    if same_payload && same_labels && same_annotations {
        return None;
    }

    let mut data = payload_of(desired);
    if let Some(status) = status_of(existing) {
        data.insert("status".to_string(), status.clone());
    }

    let mut updated = existing.clone();
    updated.metadata.labels = desired.metadata.labels.clone();
    updated.metadata.annotations = desired.metadata.annotations.clone();
    updated.data = Value::Object(data);
    Some(updated)
}

/// RFC 7386 merge patch turning `old` into `new`.
///
/// Keys present in `old` but absent from `new` are nulled so removed status
/// fields do not linger on the target.
pub fn merge_patch(old: Option<&Value>, new: &Value) -> Value {
    match (old, new) {
        (Some(Value::Object(old_map)), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (k, v) in new_map {
                match old_map.get(k) {
                    Some(old_v) if old_v == v => {}
                    Some(old_v @ Value::Object(_)) if v.is_object() => {
                        patch.insert(k.clone(), merge_patch(Some(old_v), v));
                    }
                    _ => {
                        patch.insert(k.clone(), v.clone());
                    }
                }
            }
            for k in old_map.keys() {
                if !new_map.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Apply an RFC 7386 merge patch in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                apply_merge_patch(target_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

/// Evaluate an equality-based label selector (`a=b,c,d!=e`).
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else if let Some(k) = term.strip_prefix('!') {
                !labels.contains_key(k.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rt() -> ResourceTypeDescriptor {
        ResourceTypeDescriptor::namespaced(
            "net.example.io",
            "v1alpha1",
            "TunnelEndpoint",
            "tunnelendpoints",
        )
    }

    fn object(labels: &[(&str, &str)], data: Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("tun-a".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            data,
        }
    }

    #[test]
    fn destination_marker_states() {
        let unset = object(&[(LOCAL_ORIGIN_LABEL, "true")], json!({}));
        assert_eq!(destination(&rt(), &unset, "local").unwrap(), None);

        let empty = object(&[(DESTINATION_LABEL, "")], json!({}));
        assert_eq!(destination(&rt(), &empty, "local").unwrap(), None);

        let set = object(&[(DESTINATION_LABEL, "cluster-2")], json!({}));
        assert_eq!(
            destination(&rt(), &set, "local").unwrap(),
            Some("cluster-2".to_string())
        );

        let bad = object(&[(DESTINATION_LABEL, "-bad-")], json!({}));
        assert!(matches!(
            destination(&rt(), &bad, "local"),
            Err(ReplicatorError::MalformedObject { .. })
        ));

        let itself = object(&[(DESTINATION_LABEL, "local")], json!({}));
        assert!(destination(&rt(), &itself, "local").is_err());
    }

    #[test]
    fn mirror_strips_source_markers() {
        let local = object(
            &[
                (LOCAL_ORIGIN_LABEL, "true"),
                (DESTINATION_LABEL, "cluster-2"),
                ("app", "net"),
            ],
            json!({"spec": {"podCIDR": "10.0.0.0/12"}, "status": {"phase": "Local"}}),
        );

        let mirror = build_mirror(&rt(), &local, "cluster-1").unwrap();
        let l = labels(&mirror);
        assert!(!l.contains_key(LOCAL_ORIGIN_LABEL));
        assert!(!l.contains_key(DESTINATION_LABEL));
        assert_eq!(l.get("app").map(String::as_str), Some("net"));
        assert!(is_mirror_of(&mirror, "cluster-1"));
        assert!(!is_local_origin(&mirror));
        assert_eq!(spec_of(&mirror), Some(&json!({"podCIDR": "10.0.0.0/12"})));
        assert!(status_of(&mirror).is_none());
        assert!(mirror.metadata.resource_version.is_none());
        assert_eq!(
            mirror.types.as_ref().map(|t| t.api_version.as_str()),
            Some("net.example.io/v1alpha1")
        );
    }

    #[test]
    fn mirror_update_preserves_remote_status() {
        let desired = build_mirror(
            &rt(),
            &object(
                &[(LOCAL_ORIGIN_LABEL, "true")],
                json!({"spec": {"podCIDR": "10.1.0.0/16"}}),
            ),
            "cluster-1",
        )
        .unwrap();

        let mut existing = desired.clone();
        existing.metadata.resource_version = Some("42".to_string());
        existing.data = json!({"spec": {"podCIDR": "10.0.0.0/12"}, "status": {"phase": "Ready"}});

        let updated = mirror_update(&existing, &desired).expect("spec differs");
        assert_eq!(spec_of(&updated), Some(&json!({"podCIDR": "10.1.0.0/16"})));
        assert_eq!(status_of(&updated), Some(&json!({"phase": "Ready"})));
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("42"));

        existing.data = json!({"spec": {"podCIDR": "10.1.0.0/16"}, "status": {"phase": "Ready"}});
        assert!(mirror_update(&existing, &desired).is_none());
    }

    #[test]
    fn merge_patch_nulls_removed_fields() {
        let old = json!({"phase": "Pending", "reason": "Waiting", "nested": {"a": 1, "b": 2}});
        let new = json!({"phase": "Ready", "nested": {"a": 1}});
        let patch = merge_patch(Some(&old), &new);
        assert_eq!(
            patch,
            json!({"phase": "Ready", "reason": null, "nested": {"b": null}})
        );

        let mut target = old.clone();
        apply_merge_patch(&mut target, &patch);
        assert_eq!(target, new);
    }

    #[test]
    fn merge_patch_from_nothing_is_the_new_value() {
        let new = json!({"phase": "Ready"});
        assert_eq!(merge_patch(None, &new), new);
    }

    #[test]
    fn selectors() {
        let l: BTreeMap<String, String> = [
            (LOCAL_ORIGIN_LABEL.to_string(), "true".to_string()),
            (DESTINATION_LABEL.to_string(), "c2".to_string()),
        ]
        .into_iter()
        .collect();

        assert!(selector_matches(&local_origin_selector(), &l));
        assert!(selector_matches(&destination_selector("c2"), &l));
        assert!(!selector_matches(&destination_selector("c3"), &l));
        assert!(!selector_matches(&mirror_selector("c1"), &l));
        assert!(selector_matches("", &l));
        assert!(selector_matches(&format!("!{}", ORIGIN_CLUSTER_LABEL), &l));
        assert!(selector_matches(&format!("{}!=c3", DESTINATION_LABEL), &l));
    }

    #[test]
    fn key_requires_namespace_for_namespaced_kinds() {
        let mut obj = object(&[], json!({}));
        assert_eq!(
            ObjectKey::of(&rt(), &obj).unwrap().to_string(),
            "default/tun-a"
        );
        obj.metadata.namespace = None;
        assert!(ObjectKey::of(&rt(), &obj).is_err());
    }
}
