//! Bounded progress channel
//!
//! One writer (the orchestrator), one reader (the caller). The writer awaits
//! capacity before producing the next event, and sees a closed channel as
//! cancellation.

use futures::Stream;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::model::RecordKind;
use crate::orchestrator::SyncScope;

/// Default queue depth between orchestrator and caller
pub const DEFAULT_PROGRESS_CAPACITY: usize = 64;

/// Line sent for an unrecognized command
pub const INVALID_COMMAND: &str = "Invalid command.";

/// Failure lines kept for the run report; later failures are only counted
pub const MAX_RECORDED_FAILURES: usize = 100;

/// Running totals of a sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// Records created
    pub created: usize,
    /// Records found already present
    pub existing: usize,
    /// Records not created because a required dependency was missing
    pub skipped: usize,
    /// Items that failed
    pub failed: usize,
}

/// One notable step of a sync run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Run accepted
    RunStarted {
        /// What the run covers
        scope: SyncScope,
        /// Configured clusters
        clusters: usize,
    },
    /// A cluster is being processed
    ClusterStarted {
        /// Session name
        cluster: String,
        /// Phase being run for the cluster
        scope: SyncScope,
    },
    /// A cluster could not be enumerated
    ClusterFailed {
        /// Session name
        cluster: String,
        /// Reason
        reason: String,
    },
    /// Part of a cluster's inventory could not be read; the run goes on
    /// with what was read
    DiscoveryFailed {
        /// Session name
        cluster: String,
        /// What could not be read (`membership`, `node addresses`, ...)
        subject: String,
        /// Reason
        reason: String,
    },
    /// A node's VMs could not be enumerated
    NodeFailed {
        /// Session name
        cluster: String,
        /// Node name
        node: String,
        /// Reason
        reason: String,
    },
    /// A record was found or created
    RecordSynced {
        /// Entity type
        kind: RecordKind,
        /// Record name
        name: String,
        /// Whether it was created by this run
        created: bool,
        /// Whether it stands in for a record that could not be resolved
        fallback: bool,
    },
    /// A record could not be found or created
    RecordFailed {
        /// Entity type
        kind: RecordKind,
        /// Record name
        name: String,
        /// Reason
        reason: String,
    },
    /// A record was not created because a required dependency is missing
    RecordSkipped {
        /// Entity type
        kind: RecordKind,
        /// Record name
        name: String,
        /// Reason
        reason: String,
    },
    /// The caller went away; nothing further is enumerated
    Cancelled,
    /// Run complete
    RunFinished {
        /// Totals
        summary: SyncSummary,
    },
    /// The control command was not recognized
    InvalidCommand,
}

impl ProgressEvent {
    /// Check if the event reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ProgressEvent::ClusterFailed { .. }
                | ProgressEvent::DiscoveryFailed { .. }
                | ProgressEvent::NodeFailed { .. }
                | ProgressEvent::RecordFailed { .. }
        )
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::RunStarted { scope, clusters } => {
                write!(f, "Sync started ({scope}) across {clusters} cluster(s)")
            }
            ProgressEvent::ClusterStarted { cluster, scope } => {
                write!(f, "Cluster '{cluster}': syncing {scope}")
            }
            ProgressEvent::ClusterFailed { cluster, reason } => {
                write!(f, "Cluster '{cluster}' failed: {reason}")
            }
            ProgressEvent::DiscoveryFailed {
                cluster,
                subject,
                reason,
            } => write!(f, "Cluster '{cluster}': {subject} unavailable: {reason}"),
            ProgressEvent::NodeFailed {
                cluster,
                node,
                reason,
            } => write!(f, "Node '{node}' on cluster '{cluster}' failed: {reason}"),
            ProgressEvent::RecordSynced {
                kind,
                name,
                created,
                fallback,
            } => {
                let verb = if *created { "created" } else { "already exists" };
                write!(f, "{kind} '{name}' {verb}")?;
                if *fallback {
                    f.write_str(" (fallback)")?;
                }
                Ok(())
            }
            ProgressEvent::RecordFailed { kind, name, reason } => {
                write!(f, "{kind} '{name}' failed: {reason}")
            }
            ProgressEvent::RecordSkipped { kind, name, reason } => {
                write!(f, "{kind} '{name}' skipped: {reason}")
            }
            ProgressEvent::Cancelled => f.write_str("Sync cancelled: progress receiver closed"),
            ProgressEvent::RunFinished { summary } => write!(
                f,
                "Sync finished: {} created, {} existing, {} skipped, {} failed",
                summary.created, summary.existing, summary.skipped, summary.failed
            ),
            ProgressEvent::InvalidCommand => f.write_str(INVALID_COMMAND),
        }
    }
}

/// Create a bounded progress channel
pub fn channel(capacity: usize) -> (ProgressSender, ProgressStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ProgressSender {
            tx,
            summary: SyncSummary::default(),
            failures: Vec::new(),
        },
        ProgressStream { rx },
    )
}

/// Writing half, owned by exactly one run
#[derive(Debug)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
    summary: SyncSummary,
    failures: Vec<String>,
}

impl ProgressSender {
    /// Log, tally and send one event, waiting for capacity.
    /// Returns `false` once the receiver is gone.
    pub async fn emit(&mut self, event: ProgressEvent) -> bool {
        match &event {
            ProgressEvent::RecordSynced { created: true, .. } => self.summary.created += 1,
            ProgressEvent::RecordSynced { created: false, .. } => self.summary.existing += 1,
            ProgressEvent::RecordSkipped { .. } => self.summary.skipped += 1,
            _ => {}
        }

        if event.is_failure() {
            self.summary.failed += 1;
            if self.failures.len() < MAX_RECORDED_FAILURES {
                self.failures.push(event.to_string());
            }
            warn!("{}", event);
        } else {
            info!("{}", event);
        }

        self.tx.send(event).await.is_ok()
    }

    /// Check if the receiver is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Totals so far
    pub fn summary(&self) -> SyncSummary {
        self.summary
    }

    /// Rendered failure lines so far, at most [`MAX_RECORDED_FAILURES`]
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub(crate) fn into_failures(self) -> Vec<String> {
        self.failures
    }
}

/// Reading half, consumed by the caller
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressStream {
    /// Next event, or `None` once the run is over
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Drain every remaining event
    pub async fn collect_all(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }

    /// Stop receiving; the run observes this as cancellation
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn synced(name: &str, created: bool) -> ProgressEvent {
        ProgressEvent::RecordSynced {
            kind: RecordKind::Device,
            name: name.to_string(),
            created,
            fallback: false,
        }
    }

    #[test]
    fn events_render_as_single_lines() {
        assert_eq!(synced("pve01", true).to_string(), "Device 'pve01' created");
        assert_eq!(synced("pve01", false).to_string(), "Device 'pve01' already exists");
        assert_eq!(ProgressEvent::InvalidCommand.to_string(), "Invalid command.");

        let fallback = ProgressEvent::RecordSynced {
            kind: RecordKind::Cluster,
            name: "Proxbox Basic Cluster".to_string(),
            created: false,
            fallback: true,
        };
        assert_eq!(
            fallback.to_string(),
            "Cluster 'Proxbox Basic Cluster' already exists (fallback)"
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let value = serde_json::to_value(synced("pve01", true)).expect("serialize");
        assert_eq!(
            value,
            json!({ "type": "record_synced", "kind": "device", "name": "pve01", "created": true, "fallback": false })
        );
    }

    #[tokio::test]
    async fn events_arrive_in_order_and_are_tallied() {
        let (mut tx, rx) = channel(8);
        assert!(tx.emit(synced("a", true)).await);
        assert!(tx.emit(synced("b", false)).await);
        assert!(
            tx.emit(ProgressEvent::RecordFailed {
                kind: RecordKind::Interface,
                name: "Management".to_string(),
                reason: "refused".to_string(),
            })
            .await
        );

        let summary = tx.summary();
        assert_eq!((summary.created, summary.existing, summary.failed), (1, 1, 1));
        assert_eq!(tx.failures().len(), 1);
        drop(tx);

        let names: Vec<String> = rx.map(|event| event.to_string()).collect().await;
        assert_eq!(names.len(), 3);
        assert!(names[0].contains("'a'"));
        assert!(names[2].contains("failed"));
    }

    #[test]
    fn discovery_faults_are_failures() {
        let event = ProgressEvent::DiscoveryFailed {
            cluster: "lab".to_string(),
            subject: "membership".to_string(),
            reason: "returned 503 for cluster/status".to_string(),
        };
        assert!(event.is_failure());
        assert_eq!(
            event.to_string(),
            "Cluster 'lab': membership unavailable: returned 503 for cluster/status"
        );
    }

    #[tokio::test]
    async fn failure_lines_are_capped_but_still_counted() {
        let total = MAX_RECORDED_FAILURES + 50;
        let (mut tx, rx) = channel(total);
        for i in 0..total {
            let failed = ProgressEvent::RecordFailed {
                kind: RecordKind::VirtualMachine,
                name: format!("vm{i}"),
                reason: "refused".to_string(),
            };
            assert!(tx.emit(failed).await);
        }

        assert_eq!(tx.summary().failed, total);
        assert_eq!(tx.failures().len(), MAX_RECORDED_FAILURES);
        assert!(tx.failures()[0].contains("'vm0'"));
        drop(tx);
        assert_eq!(rx.collect_all().await.len(), total);
    }

    #[tokio::test]
    async fn closed_receiver_is_observed() {
        let (mut tx, mut rx) = channel(DEFAULT_PROGRESS_CAPACITY);
        assert!(!tx.is_closed());
        rx.close();
        assert!(tx.is_closed());
        assert!(!tx.emit(ProgressEvent::Cancelled).await);
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped() {
        let (mut tx, rx) = channel(0);
        assert!(tx.emit(synced("a", true)).await);
        drop(tx);
        assert_eq!(rx.collect_all().await.len(), 1);
    }
}
