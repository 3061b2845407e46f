//! Kubernetes Events on marooned pods.
//!
//! Publishing never fails from the caller's point of view: errors are
//! logged and dropped so a broken event sink cannot stall reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` shows up as the reporting component.
    #[must_use]
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`.
pub mod reasons {
    pub const VMI_CREATED: &str = "VMICreated";
    pub const VMI_CREATION_FAILED: &str = "VMICreationFailed";
    pub const WAITING_FOR_VMI: &str = "WaitingForVMI";
    pub const WAITING_FOR_NODE: &str = "WaitingForNode";
    pub const POOL_VMI_CLAIMED: &str = "PoolVMIClaimed";
    pub const NODE_READY: &str = "NodeReady";
    pub const VMI_DELETED: &str = "VMIDeleted";
    pub const VMI_RETURNED_TO_POOL: &str = "VMIReturnedToPool";
    pub const INVALID_POD: &str = "InvalidPod";
}

/// Event actions.
pub mod actions {
    pub const PROVISION: &str = "Provision";
    pub const RELEASE: &str = "Release";
    pub const CLEANUP: &str = "Cleanup";
    pub const VALIDATE: &str = "Validate";
}
