//! Read-only views over the reflector caches.
//!
//! Snapshots are eventually consistent: anything read here may be stale,
//! which is why writes carry the snapshot's resourceVersion.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube_runtime::reflector::{ObjectRef, Store};
use tracing::warn;

use crds::pod::{has_marooned_finalizer, has_marooned_gate, is_deleting};
use crds::{MaroonedPodsConfig, VirtualMachineInstance, WarmPoolState};

use crate::error::ControllerError;

/// Split a `namespace/name` key.
pub fn split_key(key: &str) -> Result<(&str, &str), ControllerError> {
    match key.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((namespace, name))
        }
        _ => Err(ControllerError::invalid_pod(key, "key is not namespace/name")),
    }
}

#[derive(Clone)]
pub struct PodStore(Store<Pod>);

impl PodStore {
    #[must_use]
    pub fn new(store: Store<Pod>) -> Self {
        Self(store)
    }

    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.0.get(&ObjectRef::new(name).within(namespace))
    }

    /// Pods the reconciler still has work for: gated, or deleting with our finalizer.
    #[must_use]
    pub fn pending(&self) -> Vec<Arc<Pod>> {
        self.0
            .state()
            .into_iter()
            .filter(|pod| has_marooned_gate(pod) || (is_deleting(pod) && has_marooned_finalizer(pod)))
            .collect()
    }
}

#[derive(Clone)]
pub struct VmiStore(Store<VirtualMachineInstance>);

impl VmiStore {
    #[must_use]
    pub fn new(store: Store<VirtualMachineInstance>) -> Self {
        Self(store)
    }

    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachineInstance>> {
        self.0.get(&ObjectRef::new(name).within(namespace))
    }

    /// Every VMI carrying a warm pool state label, sorted by name.
    #[must_use]
    pub fn pool_members(&self) -> Vec<Arc<VirtualMachineInstance>> {
        let mut members: Vec<_> = self.0.state().into_iter().filter(|vmi| vmi.is_pool_member()).collect();
        members.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        members
    }

    /// First running, available pool VMI by name.
    #[must_use]
    pub fn first_available(&self) -> Option<Arc<VirtualMachineInstance>> {
        self.pool_members()
            .into_iter()
            .find(|vmi| vmi.pool_state() == Some(WarmPoolState::Available) && vmi.is_running())
    }

    /// Pool VMI claimed by the pod with `pod_key`.
    #[must_use]
    pub fn claimed_by(&self, pod_key: &str) -> Option<Arc<VirtualMachineInstance>> {
        self.pool_members()
            .into_iter()
            .find(|vmi| vmi.pool_state() == Some(WarmPoolState::Claimed) && vmi.claimed_by() == Some(pod_key))
    }
}

#[derive(Clone)]
pub struct NodeStore(Store<Node>);

impl NodeStore {
    #[must_use]
    pub fn new(store: Store<Node>) -> Self {
        Self(store)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.0.get(&ObjectRef::new(name))
    }
}

#[derive(Clone)]
pub struct ConfigStore(Store<MaroonedPodsConfig>);

impl ConfigStore {
    #[must_use]
    pub fn new(store: Store<MaroonedPodsConfig>) -> Self {
        Self(store)
    }

    /// The config in effect: the first by name when several exist.
    #[must_use]
    pub fn active(&self) -> Option<Arc<MaroonedPodsConfig>> {
        let mut configs = self.0.state();
        if configs.len() > 1 {
            warn!(
                count = configs.len(),
                "Multiple MaroonedPodsConfig objects found, using the first by name"
            );
        }
        configs.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        configs.into_iter().next()
    }
}

/// All caches the engine reads from.
#[derive(Clone)]
pub struct Stores {
    pub pods: PodStore,
    pub vmis: VmiStore,
    pub nodes: NodeStore,
    pub configs: ConfigStore,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("default/p1").unwrap(), ("default", "p1"));
        assert!(split_key("p1").is_err());
        assert!(split_key("/p1").is_err());
        assert!(split_key("default/").is_err());
        assert!(split_key("a/b/c").is_err());
    }
}
