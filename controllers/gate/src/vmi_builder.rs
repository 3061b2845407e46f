//! Node VM manifests.
//!
//! Dedicated and pool VMIs share one shape: masquerade pod networking, the
//! node image as a container disk, and a NoCloud cloud-init disk running
//! `kubeadm join`. A dedicated VMI is named after its pod and registers its
//! node with a `<pod>.<taintKey>` taint; a pool VMI gets a generated name and
//! is tainted only once claimed.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crds::labels::{WARM_POOL_VM_NAME_PREFIX, node_taint_key};
use crds::{
    CloudInitNoCloudSource, ContainerDiskSource, Cpu, Devices, Disk, DiskTarget, DomainResources,
    DomainSpec, Interface, MasqueradeBinding, Memory, Network, PodNetwork, VirtualMachineInstance,
    VirtualMachineInstanceSpec, Volume,
};

use crate::config::JoinConfig;
use crate::patches::pool_labels;
use crate::sizing::{VmDefaults, VmSize};

pub const CONTAINER_DISK: &str = "containerdisk";
pub const CLOUD_INIT_DISK: &str = "cloudinitdisk";
const POD_NETWORK: &str = "default";
const POOL_SUFFIX_LEN: usize = 8;

/// `maroonedpods-pool-` followed by 8 lowercase alphanumerics.
#[must_use]
pub fn generate_pool_vmi_name() -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(POOL_SUFFIX_LEN).collect();
    format!("{WARM_POOL_VM_NAME_PREFIX}{suffix}")
}

/// Shell script handed to cloud-init. `taint` is registered on the node at join time.
#[must_use]
pub fn join_script(join: &JoinConfig, taint: Option<&str>) -> String {
    let node_registration = taint.map_or_else(String::new, |key| {
        format!(
            "nodeRegistration:\n  taints:\n    - key: \"{key}\"\n      value: \"created\"\n      effect: \"NoSchedule\"\n"
        )
    });
    format!(
        "#!/bin/sh\n\
         \n\
         cat <<EOF >/tmp/kubeadm-join-config.conf\n\
         apiVersion: kubeadm.k8s.io/v1beta3\n\
         kind: JoinConfiguration\n\
         {node_registration}\
         discovery:\n  \
         bootstrapToken:\n    \
         unsafeSkipCAVerification: true\n    \
         apiServerEndpoint: \"{endpoint}\"\n    \
         token: \"{token}\"\n\
         EOF\n\
         \n\
         kubeadm join --config /tmp/kubeadm-join-config.conf --ignore-preflight-errors=all --v=5\n",
        endpoint = join.api_server_endpoint,
        token = join.token,
    )
}

fn vmi_spec(size: VmSize, image: &str, user_data: &str) -> VirtualMachineInstanceSpec {
    let memory = format!("{}Mi", size.memory_mi);
    let virtio_disk = |name: &str| Disk {
        name: name.to_string(),
        disk: Some(DiskTarget {
            bus: Some("virtio".to_string()),
        }),
    };

    VirtualMachineInstanceSpec {
        domain: DomainSpec {
            cpu: Some(Cpu {
                cores: size.cpu_cores,
                sockets: 1,
                threads: 1,
            }),
            memory: Some(Memory {
                guest: Some(memory.clone()),
            }),
            resources: Some(DomainResources {
                requests: BTreeMap::from([("memory".to_string(), memory)]),
            }),
            devices: Devices {
                disks: vec![virtio_disk(CONTAINER_DISK), virtio_disk(CLOUD_INIT_DISK)],
                interfaces: vec![Interface {
                    name: POD_NETWORK.to_string(),
                    masquerade: Some(MasqueradeBinding {}),
                }],
            },
        },
        networks: vec![Network {
            name: POD_NETWORK.to_string(),
            pod: Some(PodNetwork {}),
        }],
        volumes: vec![
            Volume {
                name: CONTAINER_DISK.to_string(),
                container_disk: Some(ContainerDiskSource {
                    image: image.to_string(),
                }),
                cloud_init_no_cloud: None,
            },
            Volume {
                name: CLOUD_INIT_DISK.to_string(),
                container_disk: None,
                cloud_init_no_cloud: Some(CloudInitNoCloudSource {
                    user_data_base64: Some(STANDARD.encode(user_data)),
                }),
            },
        ],
    }
}

/// VMI named after the pod, in the pod's namespace, sized for the pod.
#[must_use]
pub fn dedicated_vmi(
    namespace: &str,
    pod_name: &str,
    size: VmSize,
    defaults: &VmDefaults,
    join: &JoinConfig,
) -> VirtualMachineInstance {
    let taint = node_taint_key(pod_name, &defaults.taint_key);
    VirtualMachineInstance {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: vmi_spec(size, &defaults.node_image, &join_script(join, Some(&taint))),
        status: None,
    }
}

/// Base-sized pool VMI labelled `creating`.
#[must_use]
pub fn pool_vmi(namespace: &str, name: &str, defaults: &VmDefaults, join: &JoinConfig) -> VirtualMachineInstance {
    VirtualMachineInstance {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(pool_labels()),
            ..Default::default()
        },
        spec: vmi_spec(VmSize::base(defaults), &defaults.node_image, &join_script(join, None)),
        status: None,
    }
}
