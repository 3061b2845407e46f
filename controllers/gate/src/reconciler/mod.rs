//! Gate-release reconciliation.
//!
//! Each pass looks at one cached pod and takes the next step towards
//! lifting its scheduling gate:
//!
//! - no VMI yet: claim a pool VMI, or create a dedicated one
//! - VMI not running, or no node named after it: wait
//! - node present: remove the gate
//! - pod deleting: release its VMI, then drop the finalizer
//!
//! The pass reports a [`Disposition`] telling the worker how to requeue.

pub mod claim;
pub mod cleanup;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::Resource;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use crds::VirtualMachineInstance;
use crds::pod::{is_deleting, marooned_gate_count};

use crate::cluster::ClusterApi;
use crate::config::JoinConfig;
use crate::error::ControllerError;
use crate::events::{EventPublisher, actions, reasons};
use crate::metrics::{Metrics, VmiKind};
use crate::patches;
use crate::sizing::{VmDefaults, compute_vm_size};
use crate::store::{Stores, split_key};
use crate::vmi_builder::dedicated_vmi;

/// What the worker does with a key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Requeue right away and reset the key's backoff
    Immediate,
    /// Requeue after the key's next backoff delay
    BackOff,
    /// Drop the key and reset its backoff
    Forget,
}

impl Disposition {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::BackOff => "backoff",
            Self::Forget => "forget",
        }
    }
}

pub struct Reconciler {
    pub(crate) stores: Stores,
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) join: JoinConfig,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        stores: Stores,
        cluster: Arc<dyn ClusterApi>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<Metrics>,
        join: JoinConfig,
    ) -> Self {
        Self {
            stores,
            cluster,
            events,
            metrics,
            join,
        }
    }

    /// Run one pass for `key`. Errors are logged here and become `BackOff`.
    pub async fn reconcile(&self, key: &str) -> Disposition {
        match self.sync(key).await {
            Ok(disposition) => {
                debug!(pod = %key, disposition = disposition.as_str(), "Reconciled pod");
                disposition
            }
            Err(e) => {
                e.log(&format!("Failed to reconcile pod {key}"));
                Disposition::BackOff
            }
        }
    }

    async fn sync(&self, key: &str) -> Result<Disposition, ControllerError> {
        let (namespace, name) = split_key(key)?;
        let Some(pod) = self.stores.pods.get(namespace, name) else {
            debug!(pod = %key, "Pod no longer cached, dropping key");
            return Ok(Disposition::Forget);
        };

        if is_deleting(&pod) {
            return self.finalize(key, &pod).await;
        }

        match marooned_gate_count(&pod) {
            0 => {
                debug!(pod = %key, "Pod is not gated, nothing to do");
                return Ok(Disposition::Forget);
            }
            1 => {}
            count => {
                return Err(self
                    .reject(key, &pod, format!("{count} MaroonedPodsGate scheduling gates"))
                    .await);
            }
        }

        let defaults = self.vm_defaults();
        let Some(vmi) = self.find_pod_vmi(key) else {
            return self.provision(key, &pod, &defaults).await;
        };
        if vmi.is_pool_member() && self.complete_claim(key, &pod, &vmi, &defaults).await? {
            return Ok(Disposition::Immediate);
        }
        self.await_node(key, &pod, &vmi).await
    }

    /// VM settings from the active config.
    pub(crate) fn vm_defaults(&self) -> VmDefaults {
        VmDefaults::from_config(self.stores.configs.active().as_deref())
    }

    /// The VMI serving a pod: the dedicated VMI named after it, or the pool
    /// VMI it claimed.
    pub(crate) fn find_pod_vmi(&self, key: &str) -> Option<Arc<VirtualMachineInstance>> {
        let (namespace, name) = split_key(key).ok()?;
        self.stores
            .vmis
            .get(namespace, name)
            .filter(|vmi| !vmi.is_pool_member())
            .or_else(|| self.stores.vmis.claimed_by(key))
    }

    async fn provision(&self, key: &str, pod: &Pod, defaults: &VmDefaults) -> Result<Disposition, ControllerError> {
        // The VMI cache can trail our own create by a watch round trip, so a
        // pass that finds nothing cached asks the API server before claiming.
        let (namespace, name) = split_key(key)?;
        if let Some(vmi) = self
            .cluster
            .get_vmi(namespace, name)
            .await?
            .filter(|vmi| !vmi.is_pool_member())
        {
            debug!(pod = %key, "Dedicated VMI exists but is not cached yet");
            return self.await_node(key, pod, &vmi).await;
        }

        if let Some(candidate) = self.stores.vmis.first_available() {
            match self.claim_pool_vmi(key, &candidate).await {
                Ok(()) => {
                    self.complete_claim(key, pod, &candidate, defaults).await?;
                    self.publish(
                        pod,
                        EventType::Normal,
                        reasons::POOL_VMI_CLAIMED,
                        actions::PROVISION,
                        format!("Claimed pool VMI {}", candidate.metadata.name.as_deref().unwrap_or_default()),
                    )
                    .await;
                    return Ok(Disposition::Immediate);
                }
                // Lost the race or the cache is behind; look again next pass.
                Err(e) if e.is_conflict() => return Err(e),
                Err(e) => e.log(&format!("Failed to claim pool VMI for {key}, creating a dedicated VMI")),
            }
        }
        self.create_dedicated_vmi(key, pod, defaults).await
    }

    async fn create_dedicated_vmi(
        &self,
        key: &str,
        pod: &Pod,
        defaults: &VmDefaults,
    ) -> Result<Disposition, ControllerError> {
        let (namespace, name) = split_key(key)?;
        let size = match compute_vm_size(pod, defaults) {
            Ok(size) => size,
            Err(e) => return Err(self.reject(key, pod, e.to_string()).await),
        };
        let vmi = dedicated_vmi(namespace, name, size, defaults, &self.join);

        match self.cluster.create_vmi(&vmi).await {
            Ok(_) => {
                info!(
                    pod = %key,
                    cpu = size.cpu_cores,
                    memory_mi = size.memory_mi,
                    "Created dedicated VMI"
                );
                self.metrics.record_vmi_created(VmiKind::Dedicated);
                self.publish(
                    pod,
                    EventType::Normal,
                    reasons::VMI_CREATED,
                    actions::PROVISION,
                    format!("Created VMI {name} with {} cores and {}Mi", size.cpu_cores, size.memory_mi),
                )
                .await;
                Ok(Disposition::BackOff)
            }
            Err(e) if e.is_conflict() => {
                debug!(pod = %key, "Dedicated VMI already exists");
                Ok(Disposition::BackOff)
            }
            Err(e) => {
                self.publish(
                    pod,
                    EventType::Warning,
                    reasons::VMI_CREATION_FAILED,
                    actions::PROVISION,
                    format!("Failed to create VMI {name}: {e}"),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn await_node(&self, key: &str, pod: &Pod, vmi: &VirtualMachineInstance) -> Result<Disposition, ControllerError> {
        let vmi_name = vmi.metadata.name.as_deref().unwrap_or_default();
        if !vmi.is_running() {
            debug!(pod = %key, vmi = vmi_name, phase = ?vmi.phase(), "Waiting for VMI to run");
            self.publish(
                pod,
                EventType::Normal,
                reasons::WAITING_FOR_VMI,
                actions::PROVISION,
                format!("Waiting for VMI {vmi_name} to start"),
            )
            .await;
            return Ok(Disposition::BackOff);
        }
        if self.stores.nodes.get(vmi_name).is_none() {
            debug!(pod = %key, node = vmi_name, "Waiting for node to register");
            self.publish(
                pod,
                EventType::Normal,
                reasons::WAITING_FOR_NODE,
                actions::PROVISION,
                format!("Waiting for node {vmi_name} to join the cluster"),
            )
            .await;
            return Ok(Disposition::BackOff);
        }

        if let Some(patch) = patches::remove_gate(pod) {
            let (namespace, name) = split_key(key)?;
            self.cluster.patch_pod(namespace, name, &patch).await?;
        }
        info!(pod = %key, node = vmi_name, "Released scheduling gate");
        self.publish(
            pod,
            EventType::Normal,
            reasons::NODE_READY,
            actions::RELEASE,
            format!("Node {vmi_name} is ready, scheduling gate removed"),
        )
        .await;
        Ok(Disposition::Forget)
    }

    /// Report a pod that breaks a marooned pod invariant.
    async fn reject(&self, key: &str, pod: &Pod, reason: String) -> ControllerError {
        self.publish(pod, EventType::Warning, reasons::INVALID_POD, actions::VALIDATE, reason.clone())
            .await;
        ControllerError::invalid_pod(key, reason)
    }

    pub(crate) async fn publish(&self, pod: &Pod, type_: EventType, reason: &str, action: &str, note: String) {
        let reference = pod.object_ref(&());
        self.events.publish(&reference, type_, reason, action, Some(note)).await;
    }
}
