//! Cluster sessions and the session pool
//!
//! A [`ClusterSession`] is a read-only handle on one virtualization cluster.
//! The orchestrator lists nodes and VMs, asks for cluster membership and
//! reads node addresses and VM network devices. Each of those is a separate
//! call so that every request runs under its own timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::ClusterError;

/// Proxmox VE API client
pub mod proxmox;

pub use proxmox::{ProxmoxClient, ProxmoxSettings};

/// A compute node as reported by its cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Node name (`pve01`)
    pub name: String,
    /// Whether the node reports itself online
    pub online: bool,
    /// Management address, when the listing carries one; otherwise read
    /// through [`ClusterSession::node_addresses`]
    pub ip: Option<IpAddr>,
}

/// A virtual machine as reported by its node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmInfo {
    /// Cluster-wide VM id
    pub vmid: u32,
    /// VM name
    pub name: String,
    /// Node the VM currently runs on
    pub node: String,
    /// Whether the VM is running
    pub running: bool,
    /// Network devices (`net0`, `net1`, ...) when the listing carries them;
    /// otherwise read through [`ClusterSession::vm_networks`]
    pub networks: Vec<VmNetwork>,
}

/// One VM network device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmNetwork {
    /// Device key (`net0`)
    pub name: String,
    /// NIC model (`virtio`, `e1000`)
    pub model: Option<String>,
    /// MAC address
    pub mac: Option<String>,
    /// Bridge the device is attached to
    pub bridge: Option<String>,
}

/// Cluster membership as reported by a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMembership {
    /// Node(s) belong to the named cluster
    Clustered(String),
    /// Single node without a cluster
    Standalone,
}

/// Cluster software version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterVersion {
    /// Release string (`8.2.4`)
    pub version: String,
    /// Major release (`8.2`)
    #[serde(default)]
    pub release: Option<String>,
    /// Build id
    #[serde(default)]
    pub repoid: Option<String>,
}

/// Authenticated, read-only handle on one cluster
#[async_trait]
pub trait ClusterSession: Send + Sync {
    /// Configured session name
    fn name(&self) -> &str;

    /// Cluster the session's nodes belong to
    async fn membership(&self) -> Result<ClusterMembership, ClusterError>;

    /// Nodes in report order
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;

    /// VMs on one node in report order
    async fn list_vms(&self, node: &NodeInfo) -> Result<Vec<VmInfo>, ClusterError>;

    /// Management addresses keyed by node name. Sessions whose node list
    /// already carries addresses keep the default.
    async fn node_addresses(&self) -> Result<HashMap<String, IpAddr>, ClusterError> {
        Ok(HashMap::new())
    }

    /// Network devices of one VM. Sessions whose VM list already carries
    /// them keep the default.
    async fn vm_networks(&self, vm: &VmInfo) -> Result<Vec<VmNetwork>, ClusterError> {
        Ok(vm.networks.clone())
    }

    /// Software version, when the cluster reports one
    async fn version(&self) -> Result<Option<ClusterVersion>, ClusterError> {
        Ok(None)
    }
}

/// One session per configured cluster, kept in configuration order
#[derive(Clone, Default)]
pub struct ClusterPool {
    sessions: Vec<Arc<dyn ClusterSession>>,
}

impl ClusterPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool from sessions in configuration order
    pub fn from_sessions(sessions: Vec<Arc<dyn ClusterSession>>) -> Self {
        Self { sessions }
    }

    /// Append a session
    pub fn push(&mut self, session: Arc<dyn ClusterSession>) {
        self.sessions.push(session);
    }

    /// Sessions in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ClusterSession>> {
        self.sessions.iter()
    }

    /// Session names in configuration order
    pub fn names(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.name().to_string()).collect()
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for ClusterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterPool")
            .field("sessions", &self.names())
            .finish()
    }
}
