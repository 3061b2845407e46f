//! Well-known names
//!
//! Label keys, gate and finalizer names shared between the admission hook,
//! the gate controller and anything inspecting cluster state by hand.

/// Scheduling gate that holds a marooned pod until its node exists.
pub const MAROONED_PODS_GATE: &str = "MaroonedPodsGate";

/// Finalizer that keeps a marooned pod around until its VMI is released.
pub const MAROONED_PODS_FINALIZER: &str = "maroonedpods.io/finalizer";

/// Pods carrying this label are marooned at admission.
pub const MAROON_LABEL: &str = "maroonedpods.io/maroon";

/// Warm pool lifecycle state of a VMI (`creating`, `available`, `claimed`).
pub const WARM_POOL_STATE_LABEL: &str = "maroonedpods.io/warm-pool-state";

/// `namespace/name` of the pod holding a claimed pool VMI.
pub const WARM_POOL_CLAIMED_BY_LABEL: &str = "maroonedpods.io/warm-pool-claimed-by";

/// Name prefix of pool VMIs.
pub const WARM_POOL_VM_NAME_PREFIX: &str = "maroonedpods-pool-";

/// Default taint key suffix; the node taint is `<pod>.<key>`.
pub const DEFAULT_TAINT_KEY: &str = "maroonedpods.io";

/// Node label the scheduler matches against a VMI name.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Namespace the control plane runs in (and where pool VMIs live by default).
pub const DEFAULT_NAMESPACE: &str = "maroonedpods";

/// Service account allowed to lift the gate.
pub const CONTROLLER_SERVICE_ACCOUNT: &str = "maroonedpods-controller";

/// Node taint key reserving a VMI's node for one pod.
#[must_use]
pub fn node_taint_key(pod_name: &str, taint_key: &str) -> String {
    format!("{pod_name}.{taint_key}")
}

/// Full username of the controller service account in `namespace`.
#[must_use]
pub fn controller_username(namespace: &str) -> String {
    format!("system:serviceaccount:{namespace}:{CONTROLLER_SERVICE_ACCOUNT}")
}
