//! Pod admission decisions.

use k8s_openapi::api::core::v1::{Pod, PodSchedulingGate, Toleration};
use serde::Serialize;
use serde_json::{Value, json};

use crds::labels::{
    DEFAULT_NAMESPACE, DEFAULT_TAINT_KEY, HOSTNAME_LABEL, MAROONED_PODS_FINALIZER,
    MAROONED_PODS_GATE, controller_username, node_taint_key,
};
use crds::pod::{has_marooned_finalizer, has_marooned_gate, is_marooned};

use crate::error::AdmissionError;

pub const GATED_MESSAGE: &str = "Pod has successfully gated";
pub const NOT_MAROONED_MESSAGE: &str = "Pod does not request marooning";
pub const GATE_KEPT_MESSAGE: &str = "Pod update did not remove MaroonedPodsGate";
pub const CONTROLLER_REMOVAL_MESSAGE: &str =
    "MaroonedPods controller has permission to remove gate from pods";
pub const UNAUTHORIZED_REMOVAL_MESSAGE: &str =
    "Only MaroonedPods controller has permission to remove MaroonedPodsGate gate from pods";

/// Where the controller runs and which taint key its nodes use.
#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub controller_namespace: String,
    pub taint_key: String,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            controller_namespace: DEFAULT_NAMESPACE.to_string(),
            taint_key: DEFAULT_TAINT_KEY.to_string(),
        }
    }
}

/// A single RFC 6902 `add` operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PatchOperation {
    pub op: &'static str,
    pub path: String,
    pub value: Value,
}

impl PatchOperation {
    fn add(path: &str, value: Value) -> Self {
        Self { op: "add", path: path.to_string(), value }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow { message: String },
    Patch { message: String, operations: Vec<PatchOperation> },
    Deny { code: u16, message: String },
}

impl Decision {
    fn allow(message: &str) -> Self {
        Self::Allow { message: message.to_string() }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Deny { .. })
    }
}

/// Patch a newly created marooned pod so it waits for its own node.
///
/// Returns `None` for pods without the maroon label. Entries the pod
/// already carries are left alone, so resubmitting the patched pod yields
/// an empty patch.
pub fn mutate_pod_create(
    pod: &Pod,
    settings: &AdmissionSettings,
) -> Result<Option<Vec<PatchOperation>>, AdmissionError> {
    if !is_marooned(pod) {
        return Ok(None);
    }
    let name = pod
        .metadata
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or(AdmissionError::MissingPodName)?;
    let spec = pod.spec.clone().unwrap_or_default();
    let mut operations = Vec::new();

    if !has_marooned_finalizer(pod) {
        let mut finalizers = pod.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(MAROONED_PODS_FINALIZER.to_string());
        operations.push(PatchOperation::add("/metadata/finalizers", json!(finalizers)));
    }

    if !has_marooned_gate(pod) {
        let mut gates = spec.scheduling_gates.clone().unwrap_or_default();
        gates.push(PodSchedulingGate {
            name: MAROONED_PODS_GATE.to_string(),
        });
        operations.push(PatchOperation::add("/spec/schedulingGates", serde_json::to_value(gates)?));
    }

    let taint_key = node_taint_key(name, &settings.taint_key);
    let toleration = Toleration {
        key: Some(taint_key.clone()),
        operator: Some("Exists".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    };
    match spec.tolerations.as_ref() {
        Some(tolerations) if tolerations.iter().any(|t| t.key.as_deref() == Some(taint_key.as_str())) => {}
        Some(_) => operations.push(PatchOperation::add(
            "/spec/tolerations/-",
            serde_json::to_value(&toleration)?,
        )),
        None => operations.push(PatchOperation::add(
            "/spec/tolerations",
            serde_json::to_value(vec![toleration])?,
        )),
    }

    let mut selector = spec.node_selector.clone().unwrap_or_default();
    if selector.get(HOSTNAME_LABEL).map(String::as_str) != Some(name) {
        selector.insert(HOSTNAME_LABEL.to_string(), name.to_string());
        operations.push(PatchOperation::add("/spec/nodeSelector", json!(selector)));
    }

    Ok(Some(operations))
}

/// Only the controller's service account may remove the gate.
#[must_use]
pub fn validate_pod_update(old: &Pod, new: &Pod, username: &str, settings: &AdmissionSettings) -> Decision {
    if !has_marooned_gate(old) || has_marooned_gate(new) {
        return Decision::allow(GATE_KEPT_MESSAGE);
    }
    if username == controller_username(&settings.controller_namespace) {
        Decision::allow(CONTROLLER_REMOVAL_MESSAGE)
    } else {
        Decision::Deny {
            code: 403,
            message: UNAUTHORIZED_REMOVAL_MESSAGE.to_string(),
        }
    }
}

/// Create-time decision wrapping [`mutate_pod_create`].
pub fn decide_create(pod: &Pod, settings: &AdmissionSettings) -> Result<Decision, AdmissionError> {
    Ok(match mutate_pod_create(pod, settings)? {
        None => Decision::allow(NOT_MAROONED_MESSAGE),
        Some(operations) if operations.is_empty() => Decision::allow(GATED_MESSAGE),
        Some(operations) => Decision::Patch {
            message: GATED_MESSAGE.to_string(),
            operations,
        },
    })
}
