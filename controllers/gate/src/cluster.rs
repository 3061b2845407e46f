//! Cluster write boundary.
//!
//! Every mutation the controller performs goes through [`ClusterApi`], so
//! reconciliation logic can be exercised against an in-memory mock.

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams, Preconditions};
use kube::{Api, Client};
use serde_json::Value;

use crds::{MaroonedPodsConfig, VirtualMachineInstance};

use crate::error::ControllerError;

/// Writes against the cluster. 404 and 409 responses surface as
/// [`ControllerError::NotFound`] and [`ControllerError::Conflict`].
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a VMI in its metadata namespace.
    async fn create_vmi(&self, vmi: &VirtualMachineInstance) -> Result<VirtualMachineInstance, ControllerError>;

    /// Read a VMI straight from the API server, bypassing the cache.
    async fn get_vmi(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineInstance>, ControllerError>;

    /// Merge-patch a VMI and return it as stored.
    async fn patch_vmi(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<VirtualMachineInstance, ControllerError>;

    /// Delete a VMI, only if it is still at `resource_version` when given.
    async fn delete_vmi(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), ControllerError>;

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), ControllerError>;

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), ControllerError>;

    /// Merge-patch the status subresource of a `MaroonedPodsConfig`.
    async fn patch_config_status(&self, name: &str, patch: &Value) -> Result<(), ControllerError>;
}

/// [`ClusterApi`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn vmis(&self, namespace: &str) -> Api<VirtualMachineInstance> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create_vmi(&self, vmi: &VirtualMachineInstance) -> Result<VirtualMachineInstance, ControllerError> {
        let namespace = vmi
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidVmi("VMI has no namespace".to_string()))?;
        self.vmis(namespace)
            .create(&PostParams::default(), vmi)
            .await
            .map_err(ControllerError::classify)
    }

    async fn get_vmi(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineInstance>, ControllerError> {
        self.vmis(namespace)
            .get_opt(name)
            .await
            .map_err(ControllerError::classify)
    }

    async fn patch_vmi(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<VirtualMachineInstance, ControllerError> {
        self.vmis(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(ControllerError::classify)
    }

    async fn delete_vmi(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), ControllerError> {
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..DeleteParams::default()
        };
        self.vmis(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(ControllerError::classify)
    }

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), ControllerError> {
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .map_err(ControllerError::classify)
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), ControllerError> {
        Api::<Node>::all(self.client.clone())
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .map_err(ControllerError::classify)
    }

    async fn patch_config_status(&self, name: &str, patch: &Value) -> Result<(), ControllerError> {
        Api::<MaroonedPodsConfig>::all(self.client.clone())
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .map_err(ControllerError::classify)
    }
}
