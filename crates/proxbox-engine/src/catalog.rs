//! Default descriptors for every reconciled entity
//!
//! Each function here is the dependency builder for one entity type: it fixes
//! the identity, the static attributes and the dependency fields. Nothing in
//! this module talks to the IoR.

use std::net::IpAddr;

use crate::cluster::{ClusterMembership, NodeInfo, VmInfo, VmNetwork};
use crate::model::{Dependency, Identity, RecordDescriptor, RecordId, RecordKind};

/// Provenance tag name
pub const TAG_NAME: &str = "Proxbox";

/// Provenance tag slug
pub const TAG_SLUG: &str = "proxbox";

/// Provenance tag color
pub const TAG_COLOR: &str = "ff5722";

/// Name of the cluster used when a node reports no usable membership
pub const DEFAULT_CLUSTER_NAME: &str = "Proxbox Basic Cluster";

/// Name of the interface carrying a node's management address
pub const MANAGEMENT_INTERFACE: &str = "Management";

fn status(active: bool) -> &'static str {
    if active {
        "active"
    } else {
        "offline"
    }
}

/// The marker tag attached to every record the engine creates
pub fn provenance_tag() -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::Tag,
        Identity::new(
            TAG_NAME,
            TAG_SLUG,
            "Proxbox Identifier (used to identify the items the plugin created)",
        ),
    )
    .with_attribute("color", TAG_COLOR)
}

/// Site every node is placed in
pub fn site() -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::Site,
        Identity::new(
            "Proxbox Basic Site",
            "proxbox-basic-site",
            "Proxbox Basic Site (used to identify the items the plugin created)",
        ),
    )
    .with_attribute("status", "active")
}

/// Role assigned to every node device
pub fn device_role() -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::DeviceRole,
        Identity::new("Proxmox Node", "proxmox-node", "Proxmox Node (Server)"),
    )
    .with_attribute("color", "00bcd4")
    .with_attribute("vm_role", false)
}

/// Manufacturer of the default device type
pub fn manufacturer() -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::Manufacturer,
        Identity::new("Proxmox", "proxmox", "Open Source Virtualization Platform"),
    )
}

/// Device type used for every node
pub fn device_type() -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::DeviceType,
        Identity::new(
            "Proxbox Basic Device Type",
            "proxbox-basic-device-type",
            "Proxbox Basic Device Type (used when the node hardware is unknown)",
        ),
    )
    .with_dependency(Dependency::required("manufacturer", manufacturer()))
}

/// Cluster type for every Proxmox cluster
pub fn cluster_type() -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::ClusterType,
        Identity::new("Proxmox", "proxmox", "Proxmox Virtual Environment"),
    )
}

/// Cluster record for a named Proxmox cluster
pub fn cluster(name: &str) -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::Cluster,
        Identity::derived(name, format!("Proxmox cluster {name}")),
    )
    .with_attribute("status", "active")
    .with_dependency(Dependency::required("type", cluster_type()))
}

/// Cluster used when a node's own cluster cannot be resolved
pub fn default_cluster() -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::Cluster,
        Identity::new(
            DEFAULT_CLUSTER_NAME,
            "proxbox-basic-cluster",
            "Proxbox Basic Cluster (fallback when the cluster is unknown)",
        ),
    )
    .with_attribute("status", "active")
    .with_dependency(Dependency::required("type", cluster_type()))
}

/// Cluster record for a session: the reported cluster name, or the session
/// name for standalone nodes
pub fn cluster_for(membership: &ClusterMembership, session_name: &str) -> RecordDescriptor {
    match membership {
        ClusterMembership::Clustered(name) => cluster(name),
        ClusterMembership::Standalone => cluster(session_name),
    }
}

/// Device record for a node. Site, role and type are required; the cluster
/// falls back to [`default_cluster`] so a node always gets a device.
pub fn device(node: &NodeInfo, cluster: Option<RecordDescriptor>) -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::Device,
        Identity::derived(node.name.as_str(), "Proxmox node"),
    )
    .with_attribute("status", status(node.online))
    .with_dependency(Dependency::required("site", site()))
    .with_dependency(Dependency::required("role", device_role()))
    .with_dependency(Dependency::required("device_type", device_type()))
    .with_dependency(Dependency::with_fallback("cluster", cluster, default_cluster()))
}

/// Virtual machine record. The cluster is a hard dependency.
pub fn virtual_machine(vm: &VmInfo, cluster: Option<RecordDescriptor>) -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::VirtualMachine,
        Identity::derived(vm.name.as_str(), format!("Proxmox VM {}", vm.vmid)),
    )
    .with_attribute("status", status(vm.running))
    .with_dependency(Dependency::required_if_known("cluster", cluster))
}

/// Management interface on a node's device
pub fn management_interface(device: RecordId) -> RecordDescriptor {
    RecordDescriptor::new(
        RecordKind::Interface,
        Identity::derived(MANAGEMENT_INTERFACE, "Proxmox node management interface"),
    )
    .with_attribute("type", "virtual")
    .scoped_to(device)
}

/// Management address assigned to a node's interface
pub fn interface_address(ip: IpAddr, interface: RecordId) -> RecordDescriptor {
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    let address = format!("{ip}/{prefix}");
    RecordDescriptor::new(
        RecordKind::IpAddress,
        Identity::derived(address, "Proxmox node management address"),
    )
    .with_attribute("status", "active")
    .with_attribute("assigned_object_type", "dcim.interface")
    .with_attribute("assigned_object_id", interface)
}

/// Interface on a virtual machine, one per Proxmox network device
pub fn vm_interface(vm: RecordId, network: &VmNetwork) -> RecordDescriptor {
    let mut details = Vec::new();
    if let Some(model) = &network.model {
        details.push(format!("model {model}"));
    }
    if let Some(bridge) = &network.bridge {
        details.push(format!("bridge {bridge}"));
    }
    if let Some(mac) = &network.mac {
        details.push(format!("mac {mac}"));
    }

    RecordDescriptor::new(
        RecordKind::VmInterface,
        Identity::derived(network.name.as_str(), details.join(", ")),
    )
    .scoped_to(vm)
}
