//! Releasing a deleted pod's VMI.

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use crds::pod::{has_marooned_finalizer, pod_key};

use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::patches;
use crate::store::split_key;

use super::claim::return_to_pool;
use super::{Disposition, Reconciler};

impl Reconciler {
    /// Release the VMI of a deleting pod, then drop our finalizer so the
    /// deletion can complete.
    pub(crate) async fn finalize(&self, key: &str, pod: &Pod) -> Result<Disposition, ControllerError> {
        if !has_marooned_finalizer(pod) {
            debug!(pod = %key, "Deleting pod carries no finalizer of ours");
            return Ok(Disposition::Forget);
        }

        self.release_vmi(key, pod).await?;

        if let Some(patch) = patches::remove_finalizer(pod) {
            let (namespace, name) = split_key(key)?;
            match self.cluster.patch_pod(namespace, name, &patch).await {
                Ok(()) => info!(pod = %key, "Removed finalizer"),
                Err(e) if e.is_not_found() => debug!(pod = %key, "Pod already gone"),
                Err(e) => return Err(e),
            }
        }
        Ok(Disposition::Forget)
    }

    /// Return a claimed pool VMI and delete the dedicated VMI named after the pod.
    pub(crate) async fn release_vmi(&self, key: &str, pod: &Pod) -> Result<(), ControllerError> {
        let (namespace, name) = split_key(key)?;

        let returned = self.return_claimed_vmi(key, pod).await?;
        let cached = self.stores.vmis.get(namespace, name);
        if cached.as_ref().is_some_and(|vmi| vmi.is_pool_member()) {
            debug!(pod = %key, "VMI named after the pod belongs to the warm pool, leaving it");
            return Ok(());
        }
        // A claimant holds a dedicated VMI as well only when a create outran
        // the cache; ask the API server before deleting.
        if returned
            && cached.is_none()
            && self
                .cluster
                .get_vmi(namespace, name)
                .await?
                .is_none_or(|vmi| vmi.is_pool_member())
        {
            return Ok(());
        }

        match self.cluster.delete_vmi(namespace, name, None).await {
            Ok(()) => {
                info!(pod = %key, "Deleted dedicated VMI");
                self.publish(
                    pod,
                    EventType::Normal,
                    reasons::VMI_DELETED,
                    actions::CLEANUP,
                    format!("Deleted VMI {name}"),
                )
                .await;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(pod = %key, "Dedicated VMI already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Return the pool VMI claimed by `key`, if any. `true` when one was returned.
    async fn return_claimed_vmi(&self, key: &str, pod: &Pod) -> Result<bool, ControllerError> {
        if let Some(vmi) = self.stores.vmis.claimed_by(key) {
            let defaults = self.vm_defaults();
            return_to_pool(
                self.cluster.as_ref(),
                &self.stores.nodes,
                &self.metrics,
                &vmi,
                &defaults.taint_key,
            )
            .await?;
            self.publish(
                pod,
                EventType::Normal,
                reasons::VMI_RETURNED_TO_POOL,
                actions::CLEANUP,
                format!(
                    "Returned VMI {} to the warm pool",
                    vmi.metadata.name.as_deref().unwrap_or_default()
                ),
            )
            .await;
            return Ok(true);
        }
        Ok(false)
    }

    /// Best-effort release for a pod that vanished from the cache. The
    /// finalizer normally routes deletion through [`Reconciler::finalize`];
    /// this covers pods whose finalizer was stripped by someone else.
    pub async fn handle_pod_deleted(&self, pod: &Pod) {
        let Some(key) = pod_key(pod) else {
            return;
        };
        if let Err(e) = self.release_vmi(&key, pod).await {
            e.log(&format!("Failed to release VMI of deleted pod {key}"));
        }
    }
}
