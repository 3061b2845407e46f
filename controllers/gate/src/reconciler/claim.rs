//! Warm pool claims.
//!
//! A claim relabels an available pool VMI with the pod key, guarded by the
//! cached resourceVersion so two pods can never win the same VMI. The claimed
//! node is then tainted for the pod and the pod pinned to it by hostname.

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info};

use crds::VirtualMachineInstance;
use crds::labels::node_taint_key;

use crate::cluster::ClusterApi;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::patches;
use crate::sizing::VmDefaults;
use crate::store::{NodeStore, split_key};

use super::Reconciler;

impl Reconciler {
    /// Label `vmi` as claimed by `key`. Conflict means someone else got there first.
    pub(crate) async fn claim_pool_vmi(&self, key: &str, vmi: &VirtualMachineInstance) -> Result<(), ControllerError> {
        let (namespace, name) = vmi_key(vmi)?;
        let patch = patches::claim_vmi(vmi.metadata.resource_version.as_deref(), key);
        self.cluster.patch_vmi(namespace, name, &patch).await?;
        info!(pod = %key, vmi = name, "Claimed pool VMI");
        Ok(())
    }

    /// Taint the claimed node for the pod and pin the pod to it.
    ///
    /// Returns `true` when the pod was patched, since the cached copy is then stale.
    /// The taint is skipped while the node has not registered yet; a later pass
    /// adds it before the gate can come off.
    pub(crate) async fn complete_claim(
        &self,
        key: &str,
        pod: &Pod,
        vmi: &VirtualMachineInstance,
        defaults: &VmDefaults,
    ) -> Result<bool, ControllerError> {
        let (pod_namespace, pod_name) = split_key(key)?;
        let node_name = vmi.metadata.name.as_deref().unwrap_or_default();

        match self.stores.nodes.get(node_name) {
            Some(node) => {
                let taint = node_taint_key(pod_name, &defaults.taint_key);
                if let Some(patch) = patches::add_taint(&node, &taint)? {
                    self.cluster.patch_node(node_name, &patch).await?;
                    debug!(pod = %key, node = node_name, taint = %taint, "Tainted claimed node");
                }
            }
            None => debug!(pod = %key, node = node_name, "Claimed node not registered yet, taint deferred"),
        }

        match patches::set_hostname_selector(pod, node_name) {
            Some(patch) => {
                self.cluster.patch_pod(pod_namespace, pod_name, &patch).await?;
                debug!(pod = %key, node = node_name, "Pinned pod to claimed node");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Put a claimed pool VMI back: untaint its node first, then relabel it
/// available under its cached resourceVersion.
pub(crate) async fn return_to_pool(
    cluster: &dyn ClusterApi,
    nodes: &NodeStore,
    metrics: &Metrics,
    vmi: &VirtualMachineInstance,
    taint_key: &str,
) -> Result<(), ControllerError> {
    let (namespace, name) = vmi_key(vmi)?;

    if let Some(claimant) = vmi.claimed_by() {
        let pod_name = claimant.rsplit('/').next().unwrap_or(claimant);
        let taint = node_taint_key(pod_name, taint_key);
        if let Some(node) = nodes.get(name) {
            if let Some(patch) = patches::remove_taint(&node, &taint)? {
                match cluster.patch_node(name, &patch).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }

    let patch = patches::return_vmi_to_pool(vmi.metadata.resource_version.as_deref());
    cluster.patch_vmi(namespace, name, &patch).await?;
    metrics.record_vmi_returned();
    info!(vmi = name, claimant = ?vmi.claimed_by(), "Returned VMI to the warm pool");
    Ok(())
}

fn vmi_key(vmi: &VirtualMachineInstance) -> Result<(&str, &str), ControllerError> {
    match (vmi.metadata.namespace.as_deref(), vmi.metadata.name.as_deref()) {
        (Some(namespace), Some(name)) => Ok((namespace, name)),
        _ => Err(ControllerError::InvalidVmi(format!(
            "cached VMI {} has no namespace or name",
            vmi.metadata.uid.as_deref().unwrap_or("<no uid>")
        ))),
    }
}
