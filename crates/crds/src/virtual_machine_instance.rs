//! KubeVirt VirtualMachineInstance
//!
//! The subset of `kubevirt.io/v1` VirtualMachineInstance the controller
//! reads and writes. KubeVirt owns the CRD, so it is not part of crdgen
//! output. Fields not modelled here are ignored on read, which is why
//! existing VMIs are only ever patched, never replaced.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::labels::{WARM_POOL_CLAIMED_BY_LABEL, WARM_POOL_STATE_LABEL};
use crate::warm_pool::WarmPoolState;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    namespaced,
    shortname = "vmi",
    status = "VirtualMachineInstanceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Guest hardware
    pub domain: DomainSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,

    /// Resource requests of the virt-launcher pod, as quantity strings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<DomainResources>,

    #[serde(default)]
    pub devices: Devices,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub sockets: u32,
    #[serde(default)]
    pub threads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// Memory visible to the guest, e.g. `3072Mi`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DomainResources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiskTarget {
    /// Bus type, e.g. `virtio`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masquerade: Option<MasqueradeBinding>,
}

/// Marker for the masquerade interface binding (`masquerade: {}`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct MasqueradeBinding {}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodNetwork>,
}

/// Marker for the default pod network (`pod: {}`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct PodNetwork {}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_disk: Option<ContainerDiskSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init_no_cloud: Option<CloudInitNoCloudSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDiskSource {
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitNoCloudSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_base64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VmiPhase>,

    /// Node hosting the virt-launcher pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// VMI lifecycle phase as reported by KubeVirt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum VmiPhase {
    Pending,
    Scheduling,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    /// Anything else, including the empty phase of a fresh VMI
    #[serde(other)]
    Unknown,
}

impl VirtualMachineInstance {
    fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    /// Whether the VMI carries a warm pool state label at all.
    #[must_use]
    pub fn is_pool_member(&self) -> bool {
        self.label(WARM_POOL_STATE_LABEL).is_some()
    }

    /// Parsed warm pool state. `None` for dedicated VMIs and for
    /// unrecognised label values.
    #[must_use]
    pub fn pool_state(&self) -> Option<WarmPoolState> {
        self.label(WARM_POOL_STATE_LABEL)?.parse().ok()
    }

    /// `namespace/name` of the pod that claimed this pool VMI.
    #[must_use]
    pub fn claimed_by(&self) -> Option<&str> {
        self.label(WARM_POOL_CLAIMED_BY_LABEL)
    }

    #[must_use]
    pub fn phase(&self) -> Option<VmiPhase> {
        self.status.as_ref().and_then(|status| status.phase)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase() == Some(VmiPhase::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_labels_and_phase_from_cluster_object() {
        let vmi: VirtualMachineInstance = serde_json::from_value(json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachineInstance",
            "metadata": {
                "name": "maroonedpods-pool-ab12cd34",
                "namespace": "maroonedpods",
                "labels": {
                    "maroonedpods.io/warm-pool-state": "claimed",
                    "maroonedpods.io/warm-pool-claimed-by": "default/p2"
                }
            },
            "spec": {
                "domain": {"devices": {}, "firmware": {"uuid": "ignored"}},
                "evictionStrategy": "None"
            },
            "status": {"phase": "Running", "nodeName": "worker-1", "conditions": []}
        }))
        .unwrap();

        assert!(vmi.is_pool_member());
        assert_eq!(vmi.pool_state(), Some(WarmPoolState::Claimed));
        assert_eq!(vmi.claimed_by(), Some("default/p2"));
        assert!(vmi.is_running());
    }

    #[test]
    fn unknown_phase_and_state_are_tolerated() {
        let vmi: VirtualMachineInstance = serde_json::from_value(json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachineInstance",
            "metadata": {
                "name": "odd",
                "namespace": "default",
                "labels": {"maroonedpods.io/warm-pool-state": "draining"}
            },
            "spec": {"domain": {"devices": {}}},
            "status": {"phase": "WaitingForSync"}
        }))
        .unwrap();

        assert!(vmi.is_pool_member());
        assert_eq!(vmi.pool_state(), None);
        assert_eq!(vmi.phase(), Some(VmiPhase::Unknown));
        assert!(!vmi.is_running());
    }

    #[test]
    fn dedicated_vmi_is_not_a_pool_member() {
        let vmi = VirtualMachineInstance::new("p1", VirtualMachineInstanceSpec::default());
        assert!(!vmi.is_pool_member());
        assert_eq!(vmi.claimed_by(), None);
        assert_eq!(vmi.phase(), None);
    }
}
