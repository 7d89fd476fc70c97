//! Proxmox VE API client
//!
//! Token-authenticated, read-only access to the handful of `api2/json`
//! endpoints the sync needs.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use super::{ClusterMembership, ClusterSession, ClusterVersion, NodeInfo, VmInfo, VmNetwork};
use crate::error::ClusterError;

/// Connection settings for one Proxmox cluster
#[derive(Debug, Clone)]
pub struct ProxmoxSettings {
    /// Session name used in progress output
    pub name: String,
    /// Base URL, e.g. `https://pve.example.com:8006`
    pub base_url: String,
    /// API user, e.g. `root@pam`
    pub user: String,
    /// API token id
    pub token_name: String,
    /// API token secret
    pub token_value: String,
    /// Verify the server certificate
    pub verify_tls: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct StatusEntry {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    node: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QemuEntry {
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Proxmox VE session backed by `reqwest`
pub struct ProxmoxClient {
    settings: ProxmoxSettings,
    http: reqwest::Client,
}

impl ProxmoxClient {
    /// Build a client; no request is made until the first call
    pub fn new(settings: ProxmoxSettings) -> Result<Self, ClusterError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!settings.verify_tls)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ClusterError::Transport {
                cluster: settings.name.clone(),
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self { settings, http })
    }

    fn auth_header(&self) -> String {
        format!(
            "PVEAPIToken={}!{}={}",
            self.settings.user, self.settings.token_name, self.settings.token_value
        )
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClusterError> {
        let url = format!(
            "{}/api2/json/{}",
            self.settings.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .header(AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| ClusterError::Transport {
                cluster: self.settings.name.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClusterError::Status {
                cluster: self.settings.name.clone(),
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        let envelope: Envelope<T> = response.json().await.map_err(|e| ClusterError::Decode {
            cluster: self.settings.name.clone(),
            message: e.to_string(),
        })?;
        Ok(envelope.data)
    }
}

fn is_network_key(key: &str) -> bool {
    key.strip_prefix("net")
        .map(|index| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

fn looks_like_mac(value: &str) -> bool {
    value.len() == 17 && value.split(':').count() == 6
}

/// Parse a Proxmox network device spec such as
/// `virtio=BC:24:11:2C:69:EC,bridge=vmbr0,firewall=1`
pub fn parse_network(name: &str, spec: &str) -> VmNetwork {
    let mut network = VmNetwork {
        name: name.to_string(),
        model: None,
        mac: None,
        bridge: None,
    };

    for part in spec.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key {
            "bridge" => network.bridge = Some(value.to_string()),
            "macaddr" => network.mac = Some(value.to_string()),
            "model" => network.model = Some(value.to_string()),
            _ if network.model.is_none() && looks_like_mac(value) => {
                network.model = Some(key.to_string());
                network.mac = Some(value.to_string());
            }
            _ => {}
        }
    }

    network
}

#[async_trait]
impl ClusterSession for ProxmoxClient {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn membership(&self) -> Result<ClusterMembership, ClusterError> {
        let entries: Vec<StatusEntry> = self.get("cluster/status").await?;
        Ok(entries
            .into_iter()
            .find(|entry| entry.kind == "cluster")
            .map(|entry| ClusterMembership::Clustered(entry.name))
            .unwrap_or(ClusterMembership::Standalone))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let entries: Vec<NodeEntry> = self.get("nodes").await?;
        Ok(entries
            .into_iter()
            .map(|entry| NodeInfo {
                online: entry.status.as_deref() == Some("online"),
                name: entry.node,
                ip: None,
            })
            .collect())
    }

    async fn list_vms(&self, node: &NodeInfo) -> Result<Vec<VmInfo>, ClusterError> {
        let entries: Vec<QemuEntry> = self.get(&format!("nodes/{}/qemu", node.name)).await?;
        Ok(entries
            .into_iter()
            .map(|entry| VmInfo {
                name: entry.name.unwrap_or_else(|| format!("vm-{}", entry.vmid)),
                running: entry.status.as_deref() == Some("running"),
                node: node.name.clone(),
                vmid: entry.vmid,
                networks: Vec::new(),
            })
            .collect())
    }

    async fn node_addresses(&self) -> Result<HashMap<String, IpAddr>, ClusterError> {
        let entries: Vec<StatusEntry> = self.get("cluster/status").await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.kind == "node")
            .filter_map(|entry| {
                let ip = entry.ip?.parse().ok()?;
                Some((entry.name, ip))
            })
            .collect())
    }

    async fn vm_networks(&self, vm: &VmInfo) -> Result<Vec<VmNetwork>, ClusterError> {
        let config: Map<String, Value> = self
            .get(&format!("nodes/{}/qemu/{}/config", vm.node, vm.vmid))
            .await?;
        let mut networks: Vec<VmNetwork> = config
            .iter()
            .filter(|(key, _)| is_network_key(key))
            .filter_map(|(key, value)| value.as_str().map(|spec| parse_network(key, spec)))
            .collect();
        networks.sort_by_key(|n| n.name[3..].parse::<u32>().unwrap_or(u32::MAX));
        Ok(networks)
    }

    async fn version(&self) -> Result<Option<ClusterVersion>, ClusterError> {
        self.get("version").await.map(Some)
    }
}
