use async_trait::async_trait;
use futures::future::join_all;
use proptest::prelude::*;
use proxbox_engine::progress::{self, ProgressEvent};
use proxbox_engine::{
    catalog, ClusterError, ClusterMembership, ClusterPool, ClusterSession, IorError, MemoryIor,
    NodeInfo, RecordKind, ResolveError, Resolver, SyncOptions, SyncOrchestrator, SyncScope, VmInfo,
    VmNetwork,
};
use rstest::rstest;
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Default)]
struct FakeCluster {
    name: String,
    membership: Option<String>,
    nodes: Vec<NodeInfo>,
    vms: Vec<VmInfo>,
    fail_nodes: bool,
    node_delay: Option<Duration>,
    addresses: Option<HashMap<String, IpAddr>>,
    broken_configs: Vec<String>,
    config_delay: Option<Duration>,
}

impl FakeCluster {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            membership: Some(format!("{name}-cluster")),
            ..Self::default()
        }
    }

    fn standalone_unknown(mut self) -> Self {
        self.membership = None;
        self
    }

    fn node(mut self, name: &str) -> Self {
        let octet = self.nodes.len() + 10;
        self.nodes.push(NodeInfo {
            name: name.to_string(),
            online: true,
            ip: format!("10.1.0.{octet}").parse().ok(),
        });
        self
    }

    /// Node whose address only shows up in the separate address read;
    /// `None` makes that read fail
    fn unaddressed_node(mut self, name: &str, ip: Option<&str>) -> Self {
        self.nodes.push(NodeInfo {
            name: name.to_string(),
            online: true,
            ip: None,
        });
        match ip.and_then(|ip| ip.parse().ok()) {
            Some(ip) => {
                self.addresses.get_or_insert_with(HashMap::new).insert(name.to_string(), ip);
            }
            None => self.addresses = None,
        }
        self
    }

    fn broken_config(mut self, vm: &str) -> Self {
        self.broken_configs.push(vm.to_string());
        self
    }

    fn slow_configs(mut self, delay: Duration) -> Self {
        self.config_delay = Some(delay);
        self
    }

    fn vm(mut self, node: &str, name: &str) -> Self {
        let vmid = 100 + self.vms.len() as u32;
        self.vms.push(VmInfo {
            vmid,
            name: name.to_string(),
            node: node.to_string(),
            running: true,
            networks: vec![VmNetwork {
                name: "net0".to_string(),
                model: Some("virtio".to_string()),
                mac: Some(format!("BC:24:11:00:00:{:02X}", vmid % 256)),
                bridge: Some("vmbr0".to_string()),
            }],
        });
        self
    }

    fn failing(mut self) -> Self {
        self.fail_nodes = true;
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.node_delay = Some(delay);
        self
    }
}

#[async_trait]
impl ClusterSession for FakeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn membership(&self) -> Result<ClusterMembership, ClusterError> {
        match &self.membership {
            Some(name) => Ok(ClusterMembership::Clustered(name.clone())),
            None => Err(ClusterError::Status {
                cluster: self.name.clone(),
                path: "cluster/status".to_string(),
                status: 500,
            }),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        if let Some(delay) = self.node_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_nodes {
            return Err(ClusterError::Transport {
                cluster: self.name.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(self.nodes.clone())
    }

    async fn list_vms(&self, node: &NodeInfo) -> Result<Vec<VmInfo>, ClusterError> {
        Ok(self
            .vms
            .iter()
            .filter(|vm| vm.node == node.name)
            .cloned()
            .collect())
    }

    async fn node_addresses(&self) -> Result<HashMap<String, IpAddr>, ClusterError> {
        self.addresses.clone().ok_or_else(|| ClusterError::Status {
            cluster: self.name.clone(),
            path: "cluster/status".to_string(),
            status: 503,
        })
    }

    async fn vm_networks(&self, vm: &VmInfo) -> Result<Vec<VmNetwork>, ClusterError> {
        if let Some(delay) = self.config_delay {
            tokio::time::sleep(delay).await;
        }
        if self.broken_configs.contains(&vm.name) {
            return Err(ClusterError::Status {
                cluster: self.name.clone(),
                path: format!("nodes/{}/qemu/{}/config", vm.node, vm.vmid),
                status: 500,
            });
        }
        Ok(vm.networks.clone())
    }
}

fn orchestrator(ior: &Arc<MemoryIor>, clusters: Vec<FakeCluster>, options: SyncOptions) -> SyncOrchestrator {
    let sessions = clusters
        .into_iter()
        .map(|c| Arc::new(c) as Arc<dyn ClusterSession>)
        .collect();
    SyncOrchestrator::new(ior.clone(), ClusterPool::from_sessions(sessions), options)
}

fn lab() -> FakeCluster {
    FakeCluster::new("lab")
        .node("pve01")
        .node("pve02")
        .vm("pve01", "web01")
        .vm("pve02", "db01")
}

/// Events with created flags cleared and the run totals dropped
fn normalized(events: Vec<ProgressEvent>) -> Vec<ProgressEvent> {
    events
        .into_iter()
        .filter(|e| !matches!(e, ProgressEvent::RunFinished { .. }))
        .map(|e| match e {
            ProgressEvent::RecordSynced {
                kind,
                name,
                fallback,
                ..
            } => ProgressEvent::RecordSynced {
                kind,
                name,
                created: false,
                fallback,
            },
            other => other,
        })
        .collect()
}

#[rstest]
#[case(SyncScope::Nodes)]
#[case(SyncScope::Full)]
#[tokio::test]
async fn second_run_creates_nothing_and_repeats_events(#[case] scope: SyncScope) {
    let ior = Arc::new(MemoryIor::new());
    let orchestrator = orchestrator(&ior, vec![lab()], SyncOptions::default());

    let first = orchestrator.spawn(scope).collect_all().await;
    let creates = ior.create_calls();
    let records = ior.record_count();
    let second = orchestrator.spawn(scope).collect_all().await;

    assert!(first
        .iter()
        .any(|e| matches!(e, ProgressEvent::RecordSynced { created: true, .. })));
    assert!(!second
        .iter()
        .any(|e| matches!(e, ProgressEvent::RecordSynced { created: true, .. })));
    assert_eq!(ior.create_calls(), creates);
    assert_eq!(ior.record_count(), records);
    assert_eq!(normalized(first), normalized(second));
}

fn fault_kind() -> impl Strategy<Value = Option<RecordKind>> {
    prop::option::of(prop_oneof![
        Just(RecordKind::Site),
        Just(RecordKind::DeviceRole),
        Just(RecordKind::Manufacturer),
        Just(RecordKind::DeviceType),
        Just(RecordKind::ClusterType),
        Just(RecordKind::Cluster),
    ])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn device_is_never_created_without_its_dependencies(
        names in prop::collection::btree_set("[a-z]{1,6}[0-9]{0,2}", 1..6),
        clustered in any::<bool>(),
        fault in fault_kind(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        let ior = Arc::new(MemoryIor::new());
        if let Some(kind) = fault {
            ior.fail_creates(kind);
        }

        let mut cluster = FakeCluster::new("lab");
        if !clustered {
            cluster = cluster.standalone_unknown();
        }
        for name in &names {
            cluster = cluster.node(name);
        }
        let orchestrator = orchestrator(&ior, vec![cluster], SyncOptions::default());
        runtime.block_on(async { orchestrator.run_nodes_only().collect_all().await });

        let devices = ior.records(RecordKind::Device);
        let ids = |kind| ior.records(kind).into_iter().map(|r| r.id).collect::<Vec<_>>();

        for device in &devices {
            for (field, kind) in [
                ("site", RecordKind::Site),
                ("role", RecordKind::DeviceRole),
                ("device_type", RecordKind::DeviceType),
                ("cluster", RecordKind::Cluster),
            ] {
                let id = device.reference(field);
                prop_assert!(id.is_some(), "device {} lacks {}", device.label(), field);
                prop_assert!(ids(kind).contains(&id.unwrap_or_default()));
            }
            prop_assert_eq!(device.tag_ids().len(), 1);
        }

        match fault {
            None => {
                prop_assert_eq!(devices.len(), names.len());
            }
            Some(_) => {
                prop_assert!(devices.is_empty());
            }
        }
    }
}

#[tokio::test]
async fn vm_without_cluster_is_skipped() {
    let ior = Arc::new(MemoryIor::new());
    let cluster = FakeCluster::new("lab")
        .standalone_unknown()
        .node("pve01")
        .vm("pve01", "web01");
    let orchestrator = orchestrator(&ior, vec![cluster], SyncOptions::default());

    let events = orchestrator.run_vms_only().collect_all().await;

    assert!(ior.records(RecordKind::VirtualMachine).is_empty());
    let skips: Vec<&ProgressEvent> = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::RecordSkipped { .. }))
        .collect();
    assert_eq!(skips.len(), 1);
    assert!(matches!(
        skips[0],
        ProgressEvent::RecordSkipped { kind: RecordKind::VirtualMachine, name, .. } if name == "web01"
    ));
}

#[tokio::test]
async fn vm_is_skipped_when_its_cluster_cannot_be_created() {
    let ior = Arc::new(MemoryIor::new());
    ior.fail_creates(RecordKind::Cluster);
    let orchestrator = orchestrator(&ior, vec![lab()], SyncOptions::default());

    let events = orchestrator.run_vms_only().collect_all().await;

    assert!(ior.records(RecordKind::VirtualMachine).is_empty());
    let skipped: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::RecordSkipped { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec!["web01", "db01"]);
}

#[tokio::test]
async fn node_without_membership_gets_the_default_cluster() {
    let ior = Arc::new(MemoryIor::new());
    let cluster = FakeCluster::new("lab").standalone_unknown().node("pve01");
    let orchestrator = orchestrator(&ior, vec![cluster], SyncOptions::default());

    let events = orchestrator.run_nodes_only().collect_all().await;

    let devices = ior.records(RecordKind::Device);
    let clusters = ior.records(RecordKind::Cluster);
    assert_eq!(devices.len(), 1);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].str_field("name"), Some(catalog::DEFAULT_CLUSTER_NAME));
    assert_eq!(devices[0].reference("cluster"), Some(clusters[0].id));
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::RecordSynced { kind: RecordKind::Cluster, fallback: true, .. }
    )));
}

#[tokio::test]
async fn failing_cluster_does_not_stop_its_siblings() {
    let ior = Arc::new(MemoryIor::new());
    let clusters = vec![
        FakeCluster::new("one").node("a1").node("a2"),
        FakeCluster::new("two").node("b1").failing(),
        FakeCluster::new("three").node("c1"),
    ];
    let orchestrator = orchestrator(&ior, clusters, SyncOptions::default());

    let (tx, rx) = progress::channel(512);
    let report = orchestrator.execute(SyncScope::Nodes, tx).await;
    let events = rx.collect_all().await;

    let devices: Vec<String> = ior
        .records(RecordKind::Device)
        .iter()
        .map(|r| r.label())
        .collect();
    assert_eq!(devices, vec!["a1", "a2", "c1"]);

    let started: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::ClusterStarted { cluster, .. } => Some(cluster.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["one", "three"]);

    assert_eq!(report.summary.failed, 1);
    assert!(report.failures[0].contains("two"));
    assert!(matches!(events.last(), Some(ProgressEvent::RunFinished { .. })));
}

#[tokio::test]
async fn sequential_enumeration_keeps_configuration_order() {
    let ior = Arc::new(MemoryIor::new());
    let clusters = vec![
        FakeCluster::new("one").node("a1").slow(Duration::from_millis(30)),
        FakeCluster::new("two").node("b1"),
    ];
    let options = SyncOptions {
        concurrent_enumeration: false,
        ..SyncOptions::default()
    };
    let orchestrator = orchestrator(&ior, clusters, options);

    orchestrator.run_nodes_only().collect_all().await;

    let devices: Vec<String> = ior
        .records(RecordKind::Device)
        .iter()
        .map(|r| r.label())
        .collect();
    assert_eq!(devices, vec!["a1", "b1"]);
}

#[tokio::test]
async fn repeated_ensure_on_one_slug_creates_once() {
    let ior = Arc::new(MemoryIor::new());

    for _ in 0..2 {
        let resolver = Resolver::new(ior.clone(), Duration::from_secs(5));
        for _ in 0..3 {
            resolver.ensure(&catalog::site()).await.expect("ensure site");
        }
    }

    assert_eq!(ior.records(RecordKind::Site).len(), 1);
    assert_eq!(ior.records(RecordKind::Tag).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensure_race_is_observable() {
    let ior = Arc::new(MemoryIor::new().with_latency(Duration::from_millis(20)));
    let resolver = Resolver::new(ior.clone(), Duration::from_secs(5));
    let site = catalog::site();

    let outcomes = join_all((0..8).map(|_| resolver.ensure(&site))).await;

    // Slugged endpoints reject the losers; the winner is the only record.
    assert_eq!(ior.records(RecordKind::Site).len(), 1);
    assert!(outcomes.iter().any(Result::is_ok));
    for outcome in &outcomes {
        if let Err(e) = outcome {
            assert!(matches!(
                e,
                ResolveError::Ior { source: IorError::Status { status: 400, .. }, .. }
            ));
        }
    }

    // Name-keyed endpoints have no such constraint, so racing branches may
    // leave duplicates behind. Only the bounds are checked.
    let node = NodeInfo {
        name: "pve01".to_string(),
        online: true,
        ip: None,
    };
    let device = catalog::device(&node, None);
    resolver.build_dependencies(&device).await;
    let outcomes = join_all((0..4).map(|_| resolver.ensure(&device))).await;
    let devices = ior.records(RecordKind::Device).len();
    assert!((1..=4).contains(&devices));
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 4);
}

#[tokio::test]
async fn slow_cluster_times_out_alone() {
    let ior = Arc::new(MemoryIor::new());
    let clusters = vec![
        FakeCluster::new("slow").node("s1").slow(Duration::from_millis(500)),
        FakeCluster::new("fast").node("f1"),
    ];
    let options = SyncOptions {
        call_timeout: Duration::from_millis(50),
        ..SyncOptions::default()
    };
    let orchestrator = orchestrator(&ior, clusters, options);

    let events = orchestrator.run_nodes_only().collect_all().await;

    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::ClusterFailed { cluster, reason } if cluster == "slow" && reason.contains("timed out")
    )));
    let devices: Vec<String> = ior
        .records(RecordKind::Device)
        .iter()
        .map(|r| r.label())
        .collect();
    assert_eq!(devices, vec!["f1"]);
}

#[tokio::test]
async fn slow_ior_fails_items_not_the_run() {
    let ior = Arc::new(MemoryIor::new().with_latency(Duration::from_millis(200)));
    let options = SyncOptions {
        call_timeout: Duration::from_millis(20),
        ..SyncOptions::default()
    };
    let orchestrator = orchestrator(&ior, vec![lab()], options);

    let events = orchestrator.run_nodes_only().collect_all().await;

    assert_eq!(ior.record_count(), 0);
    assert!(events.iter().any(ProgressEvent::is_failure));
    assert!(matches!(events.last(), Some(ProgressEvent::RunFinished { .. })));
}

#[tokio::test]
async fn closed_receiver_stops_the_run_before_enumeration() {
    let ior = Arc::new(MemoryIor::new());
    let orchestrator = orchestrator(&ior, vec![lab()], SyncOptions::default());

    let (tx, rx) = progress::channel(8);
    drop(rx);
    let report = orchestrator.execute(SyncScope::Full, tx).await;

    assert!(report.cancelled);
    assert_eq!(ior.calls(), 0);
    assert!(ior.records(RecordKind::Device).is_empty());
}

#[tokio::test]
async fn dropping_the_stream_mid_run_stops_enumeration() {
    let ior = Arc::new(MemoryIor::new());
    let mut cluster = FakeCluster::new("big");
    for i in 0..5 {
        cluster = cluster.node(&format!("pve{i:02}"));
    }
    let orchestrator = orchestrator(&ior, vec![cluster], SyncOptions::default());

    let (tx, mut rx) = progress::channel(1);
    let run = tokio::spawn(async move { orchestrator.execute(SyncScope::Nodes, tx).await });

    assert!(matches!(rx.next_event().await, Some(ProgressEvent::RunStarted { .. })));
    drop(rx);
    let report = run.await.expect("run task");

    assert!(report.cancelled);
    assert!(ior.records(RecordKind::Device).len() < 5);
}

fn lines(events: &[ProgressEvent]) -> Vec<String> {
    events.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn vms_whose_names_share_a_slug_are_all_created() {
    let ior = Arc::new(MemoryIor::new());
    let cluster = FakeCluster::new("lab")
        .node("pve01")
        .vm("pve01", "web.lab")
        .vm("pve01", "web-lab")
        .vm("pve01", "Web01")
        .vm("pve01", "web01");
    let orchestrator = orchestrator(&ior, vec![cluster], SyncOptions::default());

    let events = orchestrator.run_vms_only().collect_all().await;

    let mut names: Vec<String> = ior
        .records(RecordKind::VirtualMachine)
        .iter()
        .map(|r| r.label())
        .collect();
    names.sort();
    assert_eq!(names, vec!["Web01", "web-lab", "web.lab", "web01"]);
    assert_eq!(ior.records(RecordKind::VmInterface).len(), 4);
    assert!(!events.iter().any(ProgressEvent::is_failure), "{:?}", lines(&events));
}

#[tokio::test]
async fn membership_fault_reason_reaches_the_stream() {
    let ior = Arc::new(MemoryIor::new());
    let cluster = FakeCluster::new("lab")
        .standalone_unknown()
        .node("pve01")
        .vm("pve01", "web01");
    let orchestrator = orchestrator(&ior, vec![cluster], SyncOptions::default());

    let (tx, rx) = progress::channel(256);
    let report = orchestrator.execute(SyncScope::Full, tx).await;
    let events = rx.collect_all().await;

    let faults: Vec<&ProgressEvent> = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::DiscoveryFailed { .. }))
        .collect();
    assert_eq!(faults.len(), 1);
    assert!(matches!(
        faults[0],
        ProgressEvent::DiscoveryFailed { cluster, subject, reason }
            if cluster == "lab" && subject == "membership" && reason.contains("500")
    ));

    let skip = events
        .iter()
        .find_map(|e| match e {
            ProgressEvent::RecordSkipped { name, reason, .. } if name == "web01" => Some(reason.clone()),
            _ => None,
        })
        .expect("web01 is skipped");
    assert!(skip.contains("membership unavailable"), "{skip}");
    assert!(skip.contains("500"), "{skip}");

    assert!(!report.is_clean());
    assert!(report.failures.iter().any(|line| line.contains("membership unavailable")));
}

#[tokio::test]
async fn ambiguous_device_fails_its_node_and_the_run_moves_on() {
    let ior = Arc::new(MemoryIor::new());
    for _ in 0..2 {
        ior.seed(
            RecordKind::Device,
            json!({ "name": "pve01" }).as_object().cloned().unwrap_or_default(),
        );
    }
    let cluster = FakeCluster::new("lab").node("pve01").node("pve02");
    let orchestrator = orchestrator(&ior, vec![cluster], SyncOptions::default());

    let events = orchestrator.run_nodes_only().collect_all().await;

    let failed = events
        .iter()
        .position(|e| {
            matches!(e, ProgressEvent::RecordFailed { kind: RecordKind::Device, name, reason }
                if name == "pve01" && reason.contains("ambiguous"))
        })
        .expect("pve01 fails as ambiguous");
    let next = events
        .iter()
        .position(|e| {
            matches!(e, ProgressEvent::RecordSynced { kind: RecordKind::Device, name, created: true, .. }
                if name == "pve02")
        })
        .expect("pve02 is still created");
    assert!(failed < next);

    let devices = ior.records(RecordKind::Device);
    assert_eq!(devices.len(), 3);
    assert!(matches!(events.last(), Some(ProgressEvent::RunFinished { summary }) if summary.failed == 1));
}

#[tokio::test]
async fn node_addresses_are_read_separately() {
    let ior = Arc::new(MemoryIor::new());
    let cluster = FakeCluster::new("lab").unaddressed_node("pve01", Some("10.9.0.11"));
    let orchestrator = orchestrator(&ior, vec![cluster], SyncOptions::default());

    orchestrator.run_nodes_only().collect_all().await;

    let addresses = ior.records(RecordKind::IpAddress);
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].str_field("address"), Some("10.9.0.11/32"));
}

#[tokio::test]
async fn unreadable_node_addresses_are_reported_and_devices_still_sync() {
    let ior = Arc::new(MemoryIor::new());
    let cluster = FakeCluster::new("lab").unaddressed_node("pve01", None);
    let orchestrator = orchestrator(&ior, vec![cluster], SyncOptions::default());

    let events = orchestrator.run_nodes_only().collect_all().await;

    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::DiscoveryFailed { subject, reason, .. } if subject == "node addresses" && reason.contains("503")
    )));
    assert_eq!(ior.records(RecordKind::Device).len(), 1);
    assert!(ior.records(RecordKind::IpAddress).is_empty());
}

#[tokio::test]
async fn unreadable_vm_config_is_reported_and_siblings_continue() {
    let ior = Arc::new(MemoryIor::new());
    let cluster = FakeCluster::new("lab")
        .node("pve01")
        .vm("pve01", "web01")
        .vm("pve01", "web02")
        .broken_config("web01");
    let orchestrator = orchestrator(&ior, vec![cluster], SyncOptions::default());

    let events = orchestrator.run_vms_only().collect_all().await;

    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::DiscoveryFailed { subject, reason, .. }
            if subject == "network devices of VM 'web01'" && reason.contains("qemu/100/config")
    )));
    assert_eq!(ior.records(RecordKind::VirtualMachine).len(), 2);
    let interfaces = ior.records(RecordKind::VmInterface);
    assert_eq!(interfaces.len(), 1);
}

#[tokio::test]
async fn each_vm_config_read_gets_its_own_timeout() {
    let ior = Arc::new(MemoryIor::new());
    let mut cluster = FakeCluster::new("lab")
        .node("pve01")
        .slow_configs(Duration::from_millis(40));
    for i in 0..4 {
        cluster = cluster.vm("pve01", &format!("web{i:02}"));
    }
    let options = SyncOptions {
        call_timeout: Duration::from_millis(100),
        ..SyncOptions::default()
    };
    let orchestrator = orchestrator(&ior, vec![cluster], options);

    let events = orchestrator.run_vms_only().collect_all().await;

    assert!(!events.iter().any(ProgressEvent::is_failure), "{:?}", lines(&events));
    assert_eq!(ior.records(RecordKind::VmInterface).len(), 4);
}
