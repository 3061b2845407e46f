//! MaroonedPodsConfig CRD
//!
//! Cluster-scoped settings for VM sizing and the warm pool.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "maroonedpods.io",
    version = "v1alpha1",
    kind = "MaroonedPodsConfig",
    shortname = "mpc",
    status = "MaroonedPodsConfigStatus",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.warmPoolSize"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.warmPoolAvailable"}"#,
    printcolumn = r#"{"name":"Claimed","type":"integer","jsonPath":".status.warmPoolClaimed"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MaroonedPodsConfigSpec {
    /// Number of unclaimed pool VMIs to keep (creating + available)
    #[serde(default)]
    pub warm_pool_size: u32,

    /// Minimum size of every VMI and the exact size of pool VMIs
    #[serde(default, rename = "baseVMResources", skip_serializing_if = "Option::is_none")]
    pub base_vm_resources: Option<VmResources>,

    /// Added on top of the summed container requests of a pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overhead_resources: Option<OverheadResources>,

    /// Container disk image the node VMs boot from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_image: Option<String>,

    /// Suffix of the per-pod node taint key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_taint_key: Option<String>,
}

/// VM size as whole cores and MiB.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmResources {
    /// Virtual CPU cores
    pub cpu: u32,

    /// Guest memory in MiB
    pub memory_mi: u64,
}

/// Resources reserved for the node's own system components.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OverheadResources {
    /// CPU in millicores
    pub cpu_millis: u64,

    /// Memory in MiB
    pub memory_mi: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MaroonedPodsConfigStatus {
    /// Unclaimed pool VMIs (creating + available)
    #[serde(default)]
    pub warm_pool_total: i32,

    /// Pool VMIs ready to be claimed
    #[serde(default)]
    pub warm_pool_available: i32,

    /// Pool VMIs bound to a pod
    #[serde(default)]
    pub warm_pool_claimed: i32,

    /// Last time the pool counts changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pool_update: Option<chrono::DateTime<chrono::Utc>>,
}

impl MaroonedPodsConfigStatus {
    /// Whether the pool counts differ, ignoring the timestamp.
    #[must_use]
    pub fn counts_differ(&self, other: &Self) -> bool {
        self.warm_pool_total != other.warm_pool_total
            || self.warm_pool_available != other.warm_pool_available
            || self.warm_pool_claimed != other.warm_pool_claimed
    }
}
