//! Test utilities for unit testing the reconciler and the warm pool manager
//!
//! Builders for cluster objects, stores filled through reflector writers, and
//! in-memory stand-ins for the cluster API and the event sink.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod};
use kube::runtime::events::EventType;
use kube_runtime::reflector::{self, store::Writer};
use kube_runtime::watcher;
use serde_json::{Value, json};

use crds::labels::{
    MAROON_LABEL, MAROONED_PODS_FINALIZER, MAROONED_PODS_GATE, WARM_POOL_CLAIMED_BY_LABEL,
    WARM_POOL_STATE_LABEL,
};
use crds::{
    MaroonedPodsConfig, MaroonedPodsConfigSpec, VirtualMachineInstance, VirtualMachineInstanceStatus, VmResources,
    VmiPhase, WarmPoolState,
};

use crate::cluster::ClusterApi;
use crate::config::JoinConfig;
use crate::error::ControllerError;
use crate::events::EventPublisher;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::store::{ConfigStore, NodeStore, PodStore, Stores, VmiStore};
use crate::warm_pool::WarmPoolManager;

pub const POOL_NAMESPACE: &str = "maroonedpods";

/// Helper to create a pod as admission leaves it: label, gate, finalizer, hostname selector.
pub fn marooned_pod(namespace: &str, name: &str) -> Pod {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": format!("uid-{name}"),
            "resourceVersion": "1",
            "labels": { MAROON_LABEL: "true" },
            "finalizers": [MAROONED_PODS_FINALIZER],
        },
        "spec": {
            "containers": [{ "name": "app", "image": "nginx" }],
            "schedulingGates": [{ "name": MAROONED_PODS_GATE }],
            "nodeSelector": { "kubernetes.io/hostname": name },
        },
    }))
    .unwrap()
}

/// Helper to add a container with the given requests.
pub fn with_requests(pod: Pod, cpu: Option<&str>, memory: Option<&str>) -> Pod {
    let mut value = serde_json::to_value(pod).unwrap();
    let mut requests = serde_json::Map::new();
    if let Some(cpu) = cpu {
        requests.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(memory) = memory {
        requests.insert("memory".to_string(), json!(memory));
    }
    let index = value["spec"]["containers"].as_array().map_or(0, Vec::len);
    value["spec"]["containers"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "name": format!("c{index}"), "image": "busybox", "resources": { "requests": requests } }));
    serde_json::from_value(value).unwrap()
}

/// Helper to mark a pod as being deleted.
pub fn deleting(pod: Pod) -> Pod {
    let mut value = serde_json::to_value(pod).unwrap();
    value["metadata"]["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");
    serde_json::from_value(value).unwrap()
}

/// Helper to drop every scheduling gate.
pub fn ungated(pod: Pod) -> Pod {
    let mut value = serde_json::to_value(pod).unwrap();
    value["spec"]["schedulingGates"] = json!([]);
    serde_json::from_value(value).unwrap()
}

/// Helper to create a VMI. Pool VMIs carry a state label and optionally a claimant.
pub fn vmi(
    namespace: &str,
    name: &str,
    phase: Option<VmiPhase>,
    state: Option<WarmPoolState>,
    claimed_by: Option<&str>,
) -> VirtualMachineInstance {
    let mut vmi = VirtualMachineInstance::new(name, Default::default());
    vmi.metadata.namespace = Some(namespace.to_string());
    vmi.metadata.resource_version = Some("7".to_string());
    if let Some(state) = state {
        let mut labels = std::collections::BTreeMap::from([(
            WARM_POOL_STATE_LABEL.to_string(),
            state.as_label().to_string(),
        )]);
        if let Some(claimant) = claimed_by {
            labels.insert(WARM_POOL_CLAIMED_BY_LABEL.to_string(), claimant.to_string());
        }
        vmi.metadata.labels = Some(labels);
    }
    vmi.status = Some(VirtualMachineInstanceStatus {
        phase,
        node_name: None,
    });
    vmi
}

/// Helper to create a running pool VMI in the pool namespace.
pub fn pool_member(name: &str, state: WarmPoolState, claimed_by: Option<&str>) -> VirtualMachineInstance {
    vmi(POOL_NAMESPACE, name, Some(VmiPhase::Running), Some(state), claimed_by)
}

/// Helper to create a node, optionally with taints as `(key, value)`.
pub fn node(name: &str, taints: &[(&str, &str)]) -> Node {
    let taints: Vec<Value> = taints
        .iter()
        .map(|(key, value)| json!({ "key": key, "value": value, "effect": "NoSchedule" }))
        .collect();
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": { "name": name, "resourceVersion": "3" },
        "spec": { "taints": taints },
    }))
    .unwrap()
}

/// Helper to create the config singleton with a 2 CPU / 3072Mi base.
pub fn config(warm_pool_size: u32) -> MaroonedPodsConfig {
    MaroonedPodsConfig::new(
        "config",
        MaroonedPodsConfigSpec {
            warm_pool_size,
            base_vm_resources: Some(VmResources {
                cpu: 2,
                memory_mi: 3072,
            }),
            ..Default::default()
        },
    )
}

/// Reflector stores filled by hand.
pub struct TestCluster {
    pub stores: Stores,
    pods: Writer<Pod>,
    vmis: Writer<VirtualMachineInstance>,
    nodes: Writer<Node>,
    configs: Writer<MaroonedPodsConfig>,
}

impl TestCluster {
    pub fn new() -> Self {
        let (pod_store, pods) = reflector::store();
        let (vmi_store, vmis) = reflector::store();
        let (node_store, nodes) = reflector::store();
        let (config_store, configs) = reflector::store();
        Self {
            stores: Stores {
                pods: PodStore::new(pod_store),
                vmis: VmiStore::new(vmi_store),
                nodes: NodeStore::new(node_store),
                configs: ConfigStore::new(config_store),
            },
            pods,
            vmis,
            nodes,
            configs,
        }
    }

    pub fn add_pod(&mut self, pod: Pod) {
        self.pods.apply_watcher_event(&watcher::Event::Apply(pod));
    }

    pub fn add_vmi(&mut self, vmi: VirtualMachineInstance) {
        self.vmis.apply_watcher_event(&watcher::Event::Apply(vmi));
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.apply_watcher_event(&watcher::Event::Apply(node));
    }

    pub fn add_config(&mut self, config: MaroonedPodsConfig) {
        self.configs.apply_watcher_event(&watcher::Event::Apply(config));
    }
}

/// A write the controller made.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterCall {
    CreateVmi { namespace: String, name: String },
    PatchVmi { namespace: String, name: String, patch: Value },
    DeleteVmi { namespace: String, name: String, resource_version: Option<String> },
    PatchPod { namespace: String, name: String, patch: Value },
    PatchNode { name: String, patch: Value },
    PatchConfigStatus { name: String, patch: Value },
}

/// Scripted failure for the next call of one operation.
#[derive(Debug, Clone, Copy)]
pub enum MockFailure {
    NotFound,
    Conflict,
    Api,
}

impl MockFailure {
    fn into_error(self, op: &str) -> ControllerError {
        match self {
            Self::NotFound => ControllerError::NotFound(format!("{op}: not found")),
            Self::Conflict => ControllerError::Conflict(format!("{op}: conflict")),
            Self::Api => ControllerError::Watch(format!("{op}: connection reset")),
        }
    }
}

/// Records every write; fails calls scripted with [`MockClusterApi::fail_next`].
/// Reads are served from created VMIs plus those added with
/// [`MockClusterApi::add_live_vmi`], and are not recorded.
#[derive(Default)]
pub struct MockClusterApi {
    calls: Mutex<Vec<ClusterCall>>,
    created: Mutex<Vec<VirtualMachineInstance>>,
    live: Mutex<Vec<VirtualMachineInstance>>,
    failures: Mutex<HashMap<&'static str, VecDeque<MockFailure>>>,
}

impl MockClusterApi {
    /// Fail the next call of `op` (e.g. `"patch_vmi"`).
    pub fn fail_next(&self, op: &'static str, failure: MockFailure) {
        self.failures.lock().unwrap().entry(op).or_default().push_back(failure);
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created_vmis(&self) -> Vec<VirtualMachineInstance> {
        self.created.lock().unwrap().clone()
    }

    /// Make a VMI visible to reads without it being in any cache.
    pub fn add_live_vmi(&self, vmi: VirtualMachineInstance) {
        self.live.lock().unwrap().push(vmi);
    }

    fn fail(&self, op: &'static str) -> Result<(), ControllerError> {
        match self.failures.lock().unwrap().get_mut(op).and_then(VecDeque::pop_front) {
            Some(failure) => Err(failure.into_error(op)),
            None => Ok(()),
        }
    }

    fn record(&self, op: &'static str, call: ClusterCall) -> Result<(), ControllerError> {
        self.fail(op)?;
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn create_vmi(&self, vmi: &VirtualMachineInstance) -> Result<VirtualMachineInstance, ControllerError> {
        self.record(
            "create_vmi",
            ClusterCall::CreateVmi {
                namespace: vmi.metadata.namespace.clone().unwrap_or_default(),
                name: vmi.metadata.name.clone().unwrap_or_default(),
            },
        )?;
        self.created.lock().unwrap().push(vmi.clone());
        self.live.lock().unwrap().push(vmi.clone());
        Ok(vmi.clone())
    }

    async fn get_vmi(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineInstance>, ControllerError> {
        self.fail("get_vmi")?;
        Ok(self
            .live
            .lock()
            .unwrap()
            .iter()
            .find(|vmi| {
                vmi.metadata.namespace.as_deref() == Some(namespace) && vmi.metadata.name.as_deref() == Some(name)
            })
            .cloned())
    }

    /// Returns the bare VMI at resourceVersion "8"; patches are not applied.
    async fn patch_vmi(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<VirtualMachineInstance, ControllerError> {
        self.record(
            "patch_vmi",
            ClusterCall::PatchVmi {
                namespace: namespace.to_string(),
                name: name.to_string(),
                patch: patch.clone(),
            },
        )?;
        let mut vmi = VirtualMachineInstance::new(name, Default::default());
        vmi.metadata.namespace = Some(namespace.to_string());
        vmi.metadata.resource_version = Some("8".to_string());
        Ok(vmi)
    }

    async fn delete_vmi(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), ControllerError> {
        self.record(
            "delete_vmi",
            ClusterCall::DeleteVmi {
                namespace: namespace.to_string(),
                name: name.to_string(),
                resource_version: resource_version.map(str::to_string),
            },
        )
    }

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), ControllerError> {
        self.record(
            "patch_pod",
            ClusterCall::PatchPod {
                namespace: namespace.to_string(),
                name: name.to_string(),
                patch: patch.clone(),
            },
        )
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), ControllerError> {
        self.record(
            "patch_node",
            ClusterCall::PatchNode {
                name: name.to_string(),
                patch: patch.clone(),
            },
        )
    }

    async fn patch_config_status(&self, name: &str, patch: &Value) -> Result<(), ControllerError> {
        self.record(
            "patch_config_status",
            ClusterCall::PatchConfigStatus {
                name: name.to_string(),
                patch: patch.clone(),
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub reason: String,
    pub warning: bool,
}

/// Keeps published events in memory.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|e| e.reason.clone()).collect()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: resource_ref.name.clone().unwrap_or_default(),
            reason: reason.to_string(),
            warning: matches!(type_, EventType::Warning),
        });
    }
}

/// Everything a reconciler or pool manager needs, backed by the fakes above.
pub struct Harness {
    pub cluster: TestCluster,
    pub api: Arc<MockClusterApi>,
    pub events: Arc<RecordingEventPublisher>,
    pub metrics: Arc<Metrics>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            cluster: TestCluster::new(),
            api: Arc::new(MockClusterApi::default()),
            events: Arc::new(RecordingEventPublisher::default()),
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.cluster.stores.clone(),
            self.api.clone(),
            self.events.clone(),
            self.metrics.clone(),
            JoinConfig::default(),
        )
    }

    pub fn pool_manager(&self) -> WarmPoolManager {
        WarmPoolManager::new(
            self.cluster.stores.clone(),
            self.api.clone(),
            self.metrics.clone(),
            POOL_NAMESPACE.to_string(),
            JoinConfig::default(),
        )
    }
}
