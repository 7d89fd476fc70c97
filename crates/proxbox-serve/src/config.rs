//! Application configuration from TOML and environment

use anyhow::{Context, Result};
use proxbox_engine::cluster::ProxmoxSettings;
use proxbox_engine::ior::NetboxSettings;
use proxbox_engine::SyncOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "proxbox.toml";

/// Default host address
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port number
pub const DEFAULT_PORT: u16 = 8800;

/// Default NetBox HTTPS port
pub const DEFAULT_NETBOX_PORT: u16 = 443;

/// Default Proxmox API port
pub const DEFAULT_PROXMOX_PORT: u16 = 8006;

/// Default timeout for every external call, in seconds
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Complete application configuration, assembled once at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP/WebSocket listener
    pub server: ServerConfig,

    /// Infrastructure-of-record connection
    pub netbox: NetboxConfig,

    /// One entry per Proxmox cluster, in sync order
    pub proxmox: Vec<ProxmoxConfig>,

    /// Sync tunables
    pub sync: SyncConfig,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Allowed CORS origins
    pub cors_origins: Vec<String>,

    /// Log level for tracing
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_origins: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

/// Where records are read from and written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IorBackend {
    /// NetBox REST API
    #[default]
    Http,
    /// In-process store; nothing leaves the process
    Memory,
}

/// NetBox connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetboxConfig {
    /// Backend selection
    pub backend: IorBackend,

    /// NetBox host name
    pub domain: String,

    /// NetBox port
    pub http_port: u16,

    /// API token
    pub token: String,

    /// `https` or `http`
    pub scheme: String,

    /// Verify the server certificate
    pub verify_tls: bool,

    /// Path prefix when NetBox is not served at the root
    pub base_path: String,
}

impl Default for NetboxConfig {
    fn default() -> Self {
        Self {
            backend: IorBackend::Http,
            domain: "localhost".to_string(),
            http_port: DEFAULT_NETBOX_PORT,
            token: String::new(),
            scheme: "https".to_string(),
            verify_tls: false,
            base_path: String::new(),
        }
    }
}

impl NetboxConfig {
    /// Base URL including the path prefix, without a trailing slash
    pub fn base_url(&self) -> String {
        let path = self.base_path.trim_matches('/');
        if path.is_empty() {
            format!("{}://{}:{}", self.scheme, self.domain, self.http_port)
        } else {
            format!("{}://{}:{}/{}", self.scheme, self.domain, self.http_port, path)
        }
    }

    /// Client settings
    pub fn settings(&self, timeout: Duration) -> NetboxSettings {
        NetboxSettings {
            base_url: self.base_url(),
            token: self.token.clone(),
            verify_tls: self.verify_tls,
            timeout,
        }
    }
}

/// One Proxmox cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    /// Session name; defaults to the domain
    pub name: Option<String>,

    /// Host name of any cluster member
    pub domain: String,

    /// API port
    pub http_port: u16,

    /// API user (`root@pam`)
    pub user: String,

    /// API token id
    pub token_name: String,

    /// API token secret
    #[serde(skip_serializing)]
    pub token_value: String,

    /// Verify the server certificate
    pub verify_tls: bool,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            name: None,
            domain: String::new(),
            http_port: DEFAULT_PROXMOX_PORT,
            user: "root@pam".to_string(),
            token_name: String::new(),
            token_value: String::new(),
            verify_tls: false,
        }
    }
}

impl ProxmoxConfig {
    /// Name used for the session in progress output
    pub fn session_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.domain)
    }

    /// Client settings
    pub fn settings(&self, timeout: Duration) -> ProxmoxSettings {
        ProxmoxSettings {
            name: self.session_name().to_string(),
            base_url: format!("https://{}:{}", self.domain, self.http_port),
            user: self.user.clone(),
            token_name: self.token_name.clone(),
            token_value: self.token_value.clone(),
            verify_tls: self.verify_tls,
            timeout,
        }
    }
}

/// Sync tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Timeout for every cluster and IoR call, in seconds
    pub call_timeout_secs: u64,

    /// Progress queue depth
    pub progress_capacity: usize,

    /// Enumerate clusters concurrently
    pub concurrent_enumeration: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let defaults = SyncOptions::default();
        Self {
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            progress_capacity: defaults.progress_capacity,
            concurrent_enumeration: defaults.concurrent_enumeration,
        }
    }
}

impl SyncConfig {
    /// Call timeout as a duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Orchestrator options
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            call_timeout: self.call_timeout(),
            progress_capacity: self.progress_capacity,
            concurrent_enumeration: self.concurrent_enumeration,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Apply overrides from the process environment
    ///
    /// Environment variables:
    /// - `PROXBOX_HOST` - Server host
    /// - `PROXBOX_PORT` - Server port
    /// - `PROXBOX_LOG_LEVEL` - Log level (trace, debug, info, warn, error)
    /// - `PROXBOX_NETBOX_TOKEN` - NetBox API token
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PROXBOX_HOST") {
            self.server.host = host;
        }

        if let Some(port) = lookup("PROXBOX_PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.server.port = port;
        }

        if let Some(level) = lookup("PROXBOX_LOG_LEVEL") {
            self.server.log_level = level;
        }

        if let Some(token) = lookup("PROXBOX_NETBOX_TOKEN") {
            self.netbox.token = token;
        }
    }

    /// Socket address for the listener
    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| format!("Invalid address: {}", e))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Port cannot be zero".to_string());
        }

        if self.server.host.is_empty() {
            return Err("Host cannot be empty".to_string());
        }

        match self.server.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.server.log_level
                ));
            }
        }

        if self.netbox.backend == IorBackend::Http {
            if self.netbox.domain.is_empty() {
                return Err("NetBox domain cannot be empty".to_string());
            }
            if self.netbox.token.is_empty() {
                return Err("NetBox token is required (set PROXBOX_NETBOX_TOKEN)".to_string());
            }
            if !matches!(self.netbox.scheme.as_str(), "http" | "https") {
                return Err(format!("Invalid NetBox scheme: {}", self.netbox.scheme));
            }
        }

        let mut names = HashSet::new();
        for cluster in &self.proxmox {
            if cluster.domain.is_empty() {
                return Err("Proxmox domain cannot be empty".to_string());
            }
            if cluster.http_port == 0 {
                return Err(format!("Proxmox port cannot be zero ({})", cluster.domain));
            }
            if !names.insert(cluster.session_name()) {
                return Err(format!("Duplicate Proxmox session name: {}", cluster.session_name()));
            }
        }

        if self.sync.call_timeout_secs == 0 {
            return Err("Call timeout must be greater than zero".to_string());
        }

        if self.sync.progress_capacity == 0 {
            return Err("Progress capacity must be greater than zero".to_string());
        }

        Ok(())
    }
}
