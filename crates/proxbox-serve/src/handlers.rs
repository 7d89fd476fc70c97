//! HTTP request handlers

use axum::{extract::State, routing::get, Json, Router};
use proxbox_engine::{ClusterStatus, ClusterVersion, ProvenanceTag, SessionReport, SyncOrchestrator};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::{AppConfig, IorBackend};
use crate::error::ApiResult;
use crate::websocket::{self, SessionInfo, SessionRegistry};

/// Shared application state
#[derive(Clone, Debug)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<AppConfig>,

    /// Sync engine bound to the configured IoR and clusters
    pub orchestrator: SyncOrchestrator,

    /// Open WebSocket control sessions
    pub sessions: SessionRegistry,
}

impl AppState {
    /// Create application state
    pub fn new(config: AppConfig, orchestrator: SyncOrchestrator) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator,
            sessions: SessionRegistry::new(),
        }
    }
}

/// One configured cluster, without credentials
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    /// Session name
    pub name: String,
    /// API host
    pub domain: String,
    /// API port
    pub http_port: u16,
    /// API user
    pub user: String,
}

/// Service banner
pub async fn service_info(State(state): State<AppState>) -> Json<Value> {
    let netbox = match state.config.netbox.backend {
        IorBackend::Http => state.config.netbox.base_url(),
        IorBackend::Memory => "memory".to_string(),
    };

    Json(json!({
        "service": "proxbox",
        "version": env!("CARGO_PKG_VERSION"),
        "netbox": netbox,
        "clusters": state.orchestrator.pool().len(),
        "websockets": ["/ws", "/ws/virtual-machine"],
    }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "proxbox",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.sessions.count().await,
    }))
}

/// Configured clusters in sync order
pub async fn list_clusters(State(state): State<AppState>) -> Json<Vec<ClusterSummary>> {
    let clusters = state
        .config
        .proxmox
        .iter()
        .map(|cluster| ClusterSummary {
            name: cluster.session_name().to_string(),
            domain: cluster.domain.clone(),
            http_port: cluster.http_port,
            user: cluster.user.clone(),
        })
        .collect();

    Json(clusters)
}

/// Open WebSocket control sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list().await)
}

/// Find or create the provenance tag
pub async fn provenance_tag(State(state): State<AppState>) -> ApiResult<Json<ProvenanceTag>> {
    let tag = state.orchestrator.resolver().provenance_tag().await?;
    Ok(Json(tag))
}

/// Software version of every configured cluster
pub async fn proxmox_versions(State(state): State<AppState>) -> Json<Vec<SessionReport<ClusterVersion>>> {
    Json(state.orchestrator.cluster_versions().await)
}

/// Membership and node addresses of every configured cluster
pub async fn proxmox_cluster_status(State(state): State<AppState>) -> Json<Vec<SessionReport<ClusterStatus>>> {
    Json(state.orchestrator.cluster_statuses().await)
}

/// NetBox status as NetBox reports it
pub async fn netbox_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(state.orchestrator.ior_status().await?))
}

/// NetBox overview: where it is, whether it answers, and its provenance tag.
/// Each part reports its own failure.
pub async fn netbox_overview(State(state): State<AppState>) -> Json<Value> {
    let netbox = &state.config.netbox;
    let (backend, url) = match netbox.backend {
        IorBackend::Http => ("http", Some(netbox.base_url())),
        IorBackend::Memory => ("memory", None),
    };

    let status = match state.orchestrator.ior_status().await {
        Ok(status) => status,
        Err(e) => json!({ "error": e.to_string() }),
    };
    let tag = match state.orchestrator.resolver().provenance_tag().await {
        Ok(tag) => json!(tag),
        Err(e) => json!({ "error": e.to_string() }),
    };

    Json(json!({
        "config": { "backend": backend, "url": url, "verify_tls": netbox.verify_tls },
        "status": status,
        "tag": tag,
    }))
}

/// Create the application router
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(service_info))
        .route("/api/health", get(health_check))
        .route("/api/clusters", get(list_clusters))
        .route("/api/sessions", get(list_sessions))
        .route("/api/proxmox/version", get(proxmox_versions))
        .route("/api/proxmox/cluster/status", get(proxmox_cluster_status))
        .route("/api/netbox", get(netbox_overview))
        .route("/api/netbox/status", get(netbox_status))
        .route("/api/netbox/tag", get(provenance_tag))
        .route("/ws", get(websocket::sync_ws_handler))
        .route("/ws/virtual-machine", get(websocket::vm_ws_handler))
}
