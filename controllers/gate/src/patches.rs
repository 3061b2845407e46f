//! JSON merge patches for every write the controller makes.
//!
//! Lists are replaced wholesale by a merge patch, so each list patch is
//! built from the cached object and carries its `resourceVersion`; if the
//! object changed in the meantime the API server answers 409.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use serde_json::{Value, json};

use crds::MaroonedPodsConfigStatus;
use crds::WarmPoolState;
use crds::labels::{
    HOSTNAME_LABEL, MAROONED_PODS_FINALIZER, MAROONED_PODS_GATE, WARM_POOL_CLAIMED_BY_LABEL,
    WARM_POOL_STATE_LABEL,
};

/// Taint value on the node of a claimed pool VMI.
pub const CLAIMED_TAINT_VALUE: &str = "claimed";

fn metadata(resource_version: Option<&str>) -> serde_json::Map<String, Value> {
    let mut metadata = serde_json::Map::new();
    if let Some(rv) = resource_version {
        metadata.insert("resourceVersion".to_string(), json!(rv));
    }
    metadata
}

fn with_labels(resource_version: Option<&str>, labels: Value) -> Value {
    let mut metadata = metadata(resource_version);
    metadata.insert("labels".to_string(), labels);
    json!({ "metadata": metadata })
}

/// Mark a pool VMI as claimed by `pod_key`.
#[must_use]
pub fn claim_vmi(resource_version: Option<&str>, pod_key: &str) -> Value {
    with_labels(
        resource_version,
        json!({
            WARM_POOL_STATE_LABEL: WarmPoolState::Claimed.as_label(),
            WARM_POOL_CLAIMED_BY_LABEL: pod_key,
        }),
    )
}

/// Put a claimed VMI back into the pool.
#[must_use]
pub fn return_vmi_to_pool(resource_version: Option<&str>) -> Value {
    with_labels(
        resource_version,
        json!({
            WARM_POOL_STATE_LABEL: WarmPoolState::Available.as_label(),
            WARM_POOL_CLAIMED_BY_LABEL: Value::Null,
        }),
    )
}

/// Promote a running pool VMI to available.
#[must_use]
pub fn promote_vmi(resource_version: Option<&str>) -> Value {
    with_labels(
        resource_version,
        json!({ WARM_POOL_STATE_LABEL: WarmPoolState::Available.as_label() }),
    )
}

/// Drop the marooned gate, keeping any other gates. `None` if there is no gate.
#[must_use]
pub fn remove_gate(pod: &Pod) -> Option<Value> {
    let gates = pod.spec.as_ref()?.scheduling_gates.as_ref()?;
    if !gates.iter().any(|gate| gate.name == MAROONED_PODS_GATE) {
        return None;
    }
    let remaining: Vec<_> = gates
        .iter()
        .filter(|gate| gate.name != MAROONED_PODS_GATE)
        .map(|gate| json!({ "name": gate.name }))
        .collect();
    Some(json!({
        "metadata": metadata(pod.metadata.resource_version.as_deref()),
        "spec": { "schedulingGates": remaining },
    }))
}

/// Point the pod's hostname selector at `node_name`. `None` if it already does.
#[must_use]
pub fn set_hostname_selector(pod: &Pod, node_name: &str) -> Option<Value> {
    let current = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_selector.as_ref())
        .and_then(|selector| selector.get(HOSTNAME_LABEL));
    if current.map(String::as_str) == Some(node_name) {
        return None;
    }
    Some(json!({
        "metadata": metadata(pod.metadata.resource_version.as_deref()),
        "spec": { "nodeSelector": { HOSTNAME_LABEL: node_name } },
    }))
}

/// Drop the marooned finalizer. `None` if it is not there.
#[must_use]
pub fn remove_finalizer(pod: &Pod) -> Option<Value> {
    let finalizers = pod.metadata.finalizers.as_ref()?;
    if !finalizers.iter().any(|f| f == MAROONED_PODS_FINALIZER) {
        return None;
    }
    let remaining: Vec<&String> = finalizers.iter().filter(|f| *f != MAROONED_PODS_FINALIZER).collect();
    let mut metadata = metadata(pod.metadata.resource_version.as_deref());
    metadata.insert("finalizers".to_string(), json!(remaining));
    Some(json!({ "metadata": metadata }))
}

fn node_taints(node: &Node) -> Vec<Taint> {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.clone())
        .unwrap_or_default()
}

/// Add a `NoSchedule` taint with `key`. `None` if the node already has it.
pub fn add_taint(node: &Node, key: &str) -> Result<Option<Value>, serde_json::Error> {
    let mut taints = node_taints(node);
    if taints.iter().any(|taint| taint.key == key) {
        return Ok(None);
    }
    taints.push(Taint {
        key: key.to_string(),
        value: Some(CLAIMED_TAINT_VALUE.to_string()),
        effect: "NoSchedule".to_string(),
        time_added: None,
    });
    Ok(Some(json!({
        "metadata": metadata(node.metadata.resource_version.as_deref()),
        "spec": { "taints": serde_json::to_value(taints)? },
    })))
}

/// Remove every taint with `key`. `None` if the node has none.
pub fn remove_taint(node: &Node, key: &str) -> Result<Option<Value>, serde_json::Error> {
    let taints = node_taints(node);
    if !taints.iter().any(|taint| taint.key == key) {
        return Ok(None);
    }
    let remaining: Vec<Taint> = taints.into_iter().filter(|taint| taint.key != key).collect();
    Ok(Some(json!({
        "metadata": metadata(node.metadata.resource_version.as_deref()),
        "spec": { "taints": serde_json::to_value(remaining)? },
    })))
}

/// Replace the pool counters on the config status.
pub fn config_status(status: &MaroonedPodsConfigStatus) -> Result<Value, serde_json::Error> {
    Ok(json!({ "status": serde_json::to_value(status)? }))
}

/// Labels a fresh pool VMI is created with.
#[must_use]
pub fn pool_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        WARM_POOL_STATE_LABEL.to_string(),
        WarmPoolState::Creating.as_label().to_string(),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, PodSchedulingGate, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(gates: &[&str], finalizers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p1".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("42".to_string()),
                finalizers: Some(finalizers.iter().map(|f| (*f).to_string()).collect()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                scheduling_gates: Some(
                    gates
                        .iter()
                        .map(|name| PodSchedulingGate { name: (*name).to_string() })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_claim_and_return_labels() {
        assert_eq!(
            claim_vmi(Some("7"), "default/p2"),
            json!({"metadata": {"resourceVersion": "7", "labels": {
                "maroonedpods.io/warm-pool-state": "claimed",
                "maroonedpods.io/warm-pool-claimed-by": "default/p2"
            }}})
        );
        assert_eq!(
            return_vmi_to_pool(None),
            json!({"metadata": {"labels": {
                "maroonedpods.io/warm-pool-state": "available",
                "maroonedpods.io/warm-pool-claimed-by": null
            }}})
        );
    }

    #[test]
    fn test_remove_gate_keeps_foreign_gates() {
        let patch = remove_gate(&pod(&["example.com/wait", MAROONED_PODS_GATE], &[])).unwrap();
        assert_eq!(
            patch,
            json!({"metadata": {"resourceVersion": "42"},
                   "spec": {"schedulingGates": [{"name": "example.com/wait"}]}})
        );
        assert_eq!(remove_gate(&pod(&["example.com/wait"], &[])), None);
    }

    #[test]
    fn test_remove_finalizer() {
        let patch = remove_finalizer(&pod(&[], &["example.com/keep", MAROONED_PODS_FINALIZER])).unwrap();
        assert_eq!(patch["metadata"]["finalizers"], json!(["example.com/keep"]));
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(remove_finalizer(&pod(&[], &["example.com/keep"])), None);
    }

    #[test]
    fn test_hostname_selector_only_when_different() {
        let mut gated = pod(&[MAROONED_PODS_GATE], &[]);
        let patch = set_hostname_selector(&gated, "maroonedpods-pool-ab12cd34").unwrap();
        assert_eq!(
            patch["spec"]["nodeSelector"],
            json!({"kubernetes.io/hostname": "maroonedpods-pool-ab12cd34"})
        );

        gated.spec.as_mut().unwrap().node_selector = Some(BTreeMap::from([(
            HOSTNAME_LABEL.to_string(),
            "maroonedpods-pool-ab12cd34".to_string(),
        )]));
        assert_eq!(set_hostname_selector(&gated, "maroonedpods-pool-ab12cd34"), None);
    }

    #[test]
    fn test_taints_are_idempotent() {
        let mut node = Node {
            metadata: ObjectMeta {
                name: Some("maroonedpods-pool-ab12cd34".to_string()),
                resource_version: Some("9".to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            ..Default::default()
        };

        let patch = add_taint(&node, "p2.maroonedpods.io").unwrap().unwrap();
        assert_eq!(
            patch["spec"]["taints"],
            json!([{"key": "p2.maroonedpods.io", "value": "claimed", "effect": "NoSchedule"}])
        );

        node.spec.as_mut().unwrap().taints = Some(vec![Taint {
            key: "p2.maroonedpods.io".to_string(),
            value: Some(CLAIMED_TAINT_VALUE.to_string()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        }]);
        assert_eq!(add_taint(&node, "p2.maroonedpods.io").unwrap(), None);

        let patch = remove_taint(&node, "p2.maroonedpods.io").unwrap().unwrap();
        assert_eq!(patch["spec"]["taints"], json!([]));
    }
}
