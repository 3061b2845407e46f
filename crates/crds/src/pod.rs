//! Marooned pod predicates
//!
//! Shared between admission and the gate controller so both agree on what
//! a managed pod looks like.

use k8s_openapi::api::core::v1::Pod;

use crate::labels::{MAROON_LABEL, MAROONED_PODS_FINALIZER, MAROONED_PODS_GATE};

/// Work queue key of a pod, `namespace/name`.
#[must_use]
pub fn pod_key(pod: &Pod) -> Option<String> {
    let name = pod.metadata.name.as_deref()?;
    let namespace = pod.metadata.namespace.as_deref()?;
    Some(format!("{namespace}/{name}"))
}

/// Whether the pod opted in to marooning.
#[must_use]
pub fn is_marooned(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(MAROON_LABEL))
}

/// Number of `MaroonedPodsGate` entries in the pod's scheduling gates.
#[must_use]
pub fn marooned_gate_count(pod: &Pod) -> usize {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.scheduling_gates.as_ref())
        .map_or(0, |gates| gates.iter().filter(|gate| gate.name == MAROONED_PODS_GATE).count())
}

#[must_use]
pub fn has_marooned_gate(pod: &Pod) -> bool {
    marooned_gate_count(pod) > 0
}

#[must_use]
pub fn has_marooned_finalizer(pod: &Pod) -> bool {
    pod.metadata
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == MAROONED_PODS_FINALIZER))
}

#[must_use]
pub fn is_deleting(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}
