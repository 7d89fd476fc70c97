//! Sync control loop
//!
//! Walks clusters → nodes → VMs, resolving the IoR records each one needs and
//! streaming a progress event for every notable step. A fault is scoped to the
//! record, node or cluster that produced it; the run always continues with the
//! next sibling.
//!
//! Cluster enumeration may be fanned out across sessions, but results are
//! always processed in configuration order, nodes and VMs in report order.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::catalog;
use crate::cluster::{ClusterMembership, ClusterPool, ClusterSession, ClusterVersion, NodeInfo, VmInfo};
use crate::error::{ClusterError, IorError};
use crate::ior::IorSession;
use crate::model::{RecordDescriptor, RecordId, RecordKind};
use crate::progress::{self, ProgressEvent, ProgressSender, ProgressStream, SyncSummary};
use crate::resolver::{DependencySet, Ensured, Resolution, Resolver};

/// Which part of the inventory a run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    /// Nodes, then virtual machines
    Full,
    /// Nodes only
    Nodes,
    /// Virtual machines only
    VirtualMachines,
}

impl SyncScope {
    fn phases(self) -> &'static [SyncScope] {
        match self {
            SyncScope::Full => &[SyncScope::Nodes, SyncScope::VirtualMachines],
            SyncScope::Nodes => &[SyncScope::Nodes],
            SyncScope::VirtualMachines => &[SyncScope::VirtualMachines],
        }
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncScope::Full => "nodes and virtual machines",
            SyncScope::Nodes => "nodes",
            SyncScope::VirtualMachines => "virtual machines",
        })
    }
}

/// Tunables for a sync run
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Timeout applied to every cluster and IoR call
    pub call_timeout: Duration,
    /// Progress queue depth
    pub progress_capacity: usize,
    /// Enumerate clusters concurrently
    pub concurrent_enumeration: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            progress_capacity: progress::DEFAULT_PROGRESS_CAPACITY,
            concurrent_enumeration: true,
        }
    }
}

/// Control-loop position, logged on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// Not started
    Idle,
    /// Asking every session for membership and nodes
    EnumeratingClusters,
    /// Walking one cluster's nodes
    EnumeratingNodes(String),
    /// Listing one node's VMs
    EnumeratingVms(String),
    /// Resolving one node's records
    ResolvingNode(String),
    /// Resolving one VM's records
    ResolvingVm(String),
    /// An item failed; the loop moves on to its next sibling
    ItemFailed(String),
    /// Run complete
    Done,
}

/// Outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// What the run covered
    pub scope: SyncScope,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run ended
    pub finished_at: DateTime<Utc>,
    /// Totals
    pub summary: SyncSummary,
    /// Whether the caller went away before the end
    pub cancelled: bool,
    /// Rendered failure lines, the first
    /// [`MAX_RECORDED_FAILURES`](crate::progress::MAX_RECORDED_FAILURES) of
    /// `summary.failed`
    pub failures: Vec<String>,
}

impl SyncReport {
    /// Wall-clock duration of the run
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Check if the run finished without failures
    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.summary.failed == 0
    }
}

/// One session's answer to an inspection call
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport<T> {
    /// Session name
    pub name: String,
    /// Answer, when the call succeeded and the session had one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Why the call failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> SessionReport<T> {
    fn new(name: &str, result: Result<Option<T>, ClusterError>) -> Self {
        let (data, error) = match result {
            Ok(data) => (data, None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            name: name.to_string(),
            data,
            error,
        }
    }
}

/// Membership and node addresses of one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    /// Cluster the session's nodes belong to
    pub membership: ClusterMembership,
    /// Management address per node
    pub addresses: BTreeMap<String, IpAddr>,
}

struct ClusterSnapshot {
    session: Arc<dyn ClusterSession>,
    cluster: Option<RecordDescriptor>,
    membership_error: Option<String>,
    /// `(subject, reason)` for each read that failed without sinking the cluster
    faults: Vec<(String, String)>,
    nodes: Result<Vec<NodeInfo>, ClusterError>,
}

struct Run {
    progress: ProgressSender,
    state: RunState,
    cancelled: bool,
}

impl Run {
    fn transition(&mut self, next: RunState) {
        debug!("Sync state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn emit(&mut self, event: ProgressEvent) {
        if !self.progress.emit(event).await {
            self.cancelled = true;
        }
    }

    fn is_cancelled(&mut self) -> bool {
        if self.progress.is_closed() {
            self.cancelled = true;
        }
        self.cancelled
    }

    async fn synced(&mut self, kind: RecordKind, ensured: &Ensured, fallback: bool) {
        self.emit(ProgressEvent::RecordSynced {
            kind,
            name: ensured.record.label(),
            created: ensured.created,
            fallback,
        })
        .await;
    }

    async fn dependencies(&mut self, dependencies: &DependencySet) {
        for entry in dependencies.iter() {
            let Some(kind) = entry.kind else { continue };
            match &entry.resolution {
                Resolution::Resolved(ensured) => self.synced(kind, ensured, false).await,
                Resolution::Fallback { ensured, .. } => self.synced(kind, ensured, true).await,
                Resolution::Missing(reason) => {
                    if let Some(name) = &entry.name {
                        self.emit(ProgressEvent::RecordFailed {
                            kind,
                            name: name.clone(),
                            reason: reason.clone(),
                        })
                        .await;
                    }
                }
            }
        }
    }
}

/// Drives sync runs over a cluster pool against one IoR
#[derive(Clone)]
pub struct SyncOrchestrator {
    ior: Arc<dyn IorSession>,
    pool: ClusterPool,
    options: SyncOptions,
}

impl SyncOrchestrator {
    /// Create an orchestrator
    pub fn new(ior: Arc<dyn IorSession>, pool: ClusterPool, options: SyncOptions) -> Self {
        Self { ior, pool, options }
    }

    /// Configured cluster sessions
    pub fn pool(&self) -> &ClusterPool {
        &self.pool
    }

    /// Run tunables
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Fresh resolver bound to this orchestrator's IoR; its memo lives as
    /// long as the resolver
    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.ior.clone(), self.options.call_timeout)
    }

    /// Software version of every session, in configuration order
    pub async fn cluster_versions(&self) -> Vec<SessionReport<ClusterVersion>> {
        join_all(self.pool.iter().map(|session| async move {
            let result = self.cluster_call(session.version()).await;
            SessionReport::new(session.name(), result)
        }))
        .await
    }

    /// Membership and node addresses of every session, in configuration order
    pub async fn cluster_statuses(&self) -> Vec<SessionReport<ClusterStatus>> {
        join_all(self.pool.iter().map(|session| async move {
            let result: Result<Option<ClusterStatus>, ClusterError> = async {
                let membership = self.cluster_call(session.membership()).await?;
                let addresses = self.cluster_call(session.node_addresses()).await?;
                Ok(Some(ClusterStatus {
                    membership,
                    addresses: addresses.into_iter().collect(),
                }))
            }
            .await;
            SessionReport::new(session.name(), result)
        }))
        .await
    }

    /// IoR backend status, bounded by the call timeout
    pub async fn ior_status(&self) -> Result<Value, IorError> {
        let limit = self.options.call_timeout;
        tokio::time::timeout(limit, self.ior.status())
            .await
            .map_err(|_| IorError::Timeout(limit))?
    }

    /// Sync nodes, then virtual machines
    pub fn run_full(&self) -> ProgressStream {
        self.spawn(SyncScope::Full)
    }

    /// Sync nodes only
    pub fn run_nodes_only(&self) -> ProgressStream {
        self.spawn(SyncScope::Nodes)
    }

    /// Sync virtual machines only
    pub fn run_vms_only(&self) -> ProgressStream {
        self.spawn(SyncScope::VirtualMachines)
    }

    /// Start a run on the current runtime and return its progress stream.
    /// Dropping the stream cancels the run.
    pub fn spawn(&self, scope: SyncScope) -> ProgressStream {
        let (tx, rx) = progress::channel(self.options.progress_capacity);
        let this = self.clone();
        tokio::spawn(async move {
            let report = this.execute(scope, tx).await;
            debug!("Sync run finished: {:?}", report.summary);
        });
        rx
    }

    /// Run to completion, writing progress to `progress`
    pub async fn execute(&self, scope: SyncScope, progress: ProgressSender) -> SyncReport {
        let started_at = Utc::now();
        let resolver = self.resolver();
        let mut run = Run {
            progress,
            state: RunState::Idle,
            cancelled: false,
        };

        run.emit(ProgressEvent::RunStarted {
            scope,
            clusters: self.pool.len(),
        })
        .await;

        let snapshots = if run.is_cancelled() {
            Vec::new()
        } else {
            run.transition(RunState::EnumeratingClusters);
            self.enumerate_clusters().await
        };

        'phases: for (index, phase) in scope.phases().iter().enumerate() {
            for snapshot in &snapshots {
                if run.is_cancelled() {
                    break 'phases;
                }
                let cluster_name = snapshot.session.name().to_string();

                if index == 0 {
                    for (subject, reason) in &snapshot.faults {
                        run.emit(ProgressEvent::DiscoveryFailed {
                            cluster: cluster_name.clone(),
                            subject: subject.clone(),
                            reason: reason.clone(),
                        })
                        .await;
                    }
                }

                let nodes = match &snapshot.nodes {
                    Ok(nodes) => nodes,
                    Err(e) => {
                        if index == 0 {
                            run.transition(RunState::ItemFailed(cluster_name.clone()));
                            run.emit(ProgressEvent::ClusterFailed {
                                cluster: cluster_name,
                                reason: e.to_string(),
                            })
                            .await;
                        }
                        continue;
                    }
                };

                run.transition(RunState::EnumeratingNodes(cluster_name.clone()));
                run.emit(ProgressEvent::ClusterStarted {
                    cluster: cluster_name,
                    scope: *phase,
                })
                .await;

                for node in nodes {
                    if run.is_cancelled() {
                        break 'phases;
                    }
                    match phase {
                        SyncScope::Nodes => {
                            self.sync_node(&resolver, &mut run, snapshot.cluster.as_ref(), node)
                                .await
                        }
                        _ => self.sync_node_vms(&resolver, &mut run, snapshot, node).await,
                    }
                }
            }
        }

        if run.is_cancelled() {
            info!("{}", ProgressEvent::Cancelled);
        } else {
            run.transition(RunState::Done);
            let summary = run.progress.summary();
            run.emit(ProgressEvent::RunFinished { summary }).await;
        }

        let summary = run.progress.summary();
        SyncReport {
            scope,
            started_at,
            finished_at: Utc::now(),
            summary,
            cancelled: run.cancelled,
            failures: run.progress.into_failures(),
        }
    }

    async fn cluster_call<T>(
        &self,
        future: impl Future<Output = Result<T, ClusterError>>,
    ) -> Result<T, ClusterError> {
        let limit = self.options.call_timeout;
        tokio::time::timeout(limit, future)
            .await
            .map_err(|_| ClusterError::Timeout(limit))?
    }

    async fn enumerate(&self, session: Arc<dyn ClusterSession>) -> ClusterSnapshot {
        let mut faults = Vec::new();
        let (cluster, membership_error) = match self.cluster_call(session.membership()).await {
            Ok(membership) => (Some(catalog::cluster_for(&membership, session.name())), None),
            Err(e) => {
                faults.push(("membership".to_string(), e.to_string()));
                (None, Some(e.to_string()))
            }
        };

        let mut nodes = self.cluster_call(session.list_nodes()).await;
        if let Ok(nodes) = &mut nodes {
            if nodes.iter().any(|node| node.ip.is_none()) {
                match self.cluster_call(session.node_addresses()).await {
                    Ok(addresses) => {
                        for node in nodes.iter_mut().filter(|node| node.ip.is_none()) {
                            node.ip = addresses.get(&node.name).copied();
                        }
                    }
                    Err(e) => faults.push(("node addresses".to_string(), e.to_string())),
                }
            }
        }

        ClusterSnapshot {
            session,
            cluster,
            membership_error,
            faults,
            nodes,
        }
    }

    async fn enumerate_clusters(&self) -> Vec<ClusterSnapshot> {
        if self.options.concurrent_enumeration {
            join_all(self.pool.iter().map(|session| self.enumerate(session.clone()))).await
        } else {
            let mut snapshots = Vec::with_capacity(self.pool.len());
            for session in self.pool.iter() {
                snapshots.push(self.enumerate(session.clone()).await);
            }
            snapshots
        }
    }

    async fn sync_node(
        &self,
        resolver: &Resolver,
        run: &mut Run,
        cluster: Option<&RecordDescriptor>,
        node: &NodeInfo,
    ) {
        run.transition(RunState::ResolvingNode(node.name.clone()));
        let descriptor = catalog::device(node, cluster.cloned());
        let dependencies = resolver.build_dependencies(&descriptor).await;
        run.dependencies(&dependencies).await;

        let device = match resolver.ensure_with(&descriptor, &dependencies).await {
            Ok(device) => device,
            Err(e) => {
                run.transition(RunState::ItemFailed(node.name.clone()));
                let event = if e.is_skip() {
                    ProgressEvent::RecordSkipped {
                        kind: RecordKind::Device,
                        name: node.name.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    ProgressEvent::RecordFailed {
                        kind: RecordKind::Device,
                        name: node.name.clone(),
                        reason: e.to_string(),
                    }
                };
                run.emit(event).await;
                return;
            }
        };
        run.synced(RecordKind::Device, &device, false).await;

        if let Some(ip) = node.ip {
            let interface = catalog::management_interface(device.id());
            let Some(interface_id) = self.ensure_item(resolver, run, &interface).await else {
                return;
            };
            let address = catalog::interface_address(ip, interface_id);
            self.ensure_item(resolver, run, &address).await;
        }
    }

    async fn sync_node_vms(
        &self,
        resolver: &Resolver,
        run: &mut Run,
        snapshot: &ClusterSnapshot,
        node: &NodeInfo,
    ) {
        run.transition(RunState::EnumeratingVms(node.name.clone()));
        let vms = match self.cluster_call(snapshot.session.list_vms(node)).await {
            Ok(vms) => vms,
            Err(e) => {
                run.transition(RunState::ItemFailed(node.name.clone()));
                run.emit(ProgressEvent::NodeFailed {
                    cluster: snapshot.session.name().to_string(),
                    node: node.name.clone(),
                    reason: e.to_string(),
                })
                .await;
                return;
            }
        };

        for vm in &vms {
            if run.is_cancelled() {
                return;
            }
            self.sync_vm(resolver, run, snapshot, vm).await;
        }
    }

    async fn sync_vm(
        &self,
        resolver: &Resolver,
        run: &mut Run,
        snapshot: &ClusterSnapshot,
        vm: &VmInfo,
    ) {
        run.transition(RunState::ResolvingVm(vm.name.clone()));
        let descriptor = catalog::virtual_machine(vm, snapshot.cluster.clone());
        let dependencies = resolver.build_dependencies(&descriptor).await;
        run.dependencies(&dependencies).await;

        if let Some(missing) = dependencies.missing() {
            let reason = match (&missing.resolution, &snapshot.membership_error) {
                (Resolution::Missing(_), Some(error))
                    if snapshot.cluster.is_none() && missing.field == "cluster" =>
                {
                    format!("no cluster (membership unavailable: {error})")
                }
                (Resolution::Missing(reason), _) => format!("no {} ({reason})", missing.field),
                _ => format!("no {}", missing.field),
            };
            run.transition(RunState::ItemFailed(vm.name.clone()));
            run.emit(ProgressEvent::RecordSkipped {
                kind: RecordKind::VirtualMachine,
                name: vm.name.clone(),
                reason,
            })
            .await;
            return;
        }

        let Some(vm_id) = self.ensure_item(resolver, run, &descriptor).await else {
            return;
        };

        let networks = match self.cluster_call(snapshot.session.vm_networks(vm)).await {
            Ok(networks) => networks,
            Err(e) => {
                run.transition(RunState::ItemFailed(vm.name.clone()));
                run.emit(ProgressEvent::DiscoveryFailed {
                    cluster: snapshot.session.name().to_string(),
                    subject: format!("network devices of VM '{}'", vm.name),
                    reason: e.to_string(),
                })
                .await;
                return;
            }
        };

        for network in &networks {
            let interface = catalog::vm_interface(vm_id, network);
            self.ensure_item(resolver, run, &interface).await;
        }
    }

    /// Ensure one record, reporting the outcome; returns its id on success
    async fn ensure_item(
        &self,
        resolver: &Resolver,
        run: &mut Run,
        descriptor: &RecordDescriptor,
    ) -> Option<RecordId> {
        match resolver.ensure(descriptor).await {
            Ok(ensured) => {
                run.synced(descriptor.kind, &ensured, false).await;
                Some(ensured.id())
            }
            Err(e) => {
                run.transition(RunState::ItemFailed(descriptor.name().to_string()));
                let event = if e.is_skip() {
                    ProgressEvent::RecordSkipped {
                        kind: descriptor.kind,
                        name: descriptor.name().to_string(),
                        reason: e.to_string(),
                    }
                } else {
                    ProgressEvent::RecordFailed {
                        kind: descriptor.kind,
                        name: descriptor.name().to_string(),
                        reason: e.to_string(),
                    }
                };
                run.emit(event).await;
                None
            }
        }
    }
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("pool", &self.pool)
            .field("options", &self.options)
            .finish()
    }
}
