//! proxbox-engine - Reconciliation Engine
//!
//! Discovers Proxmox nodes and virtual machines and ensures matching NetBox
//! records exist, streaming progress to the caller as it goes.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Engine error types
pub mod error;

/// Record descriptors and IoR records
pub mod model;

/// Default descriptors for every reconciled entity
pub mod catalog;

/// Infrastructure-of-record sessions (NetBox and in-memory)
pub mod ior;

/// Cluster sessions (Proxmox) and the session pool
pub mod cluster;

/// Generic get-or-create resolver
pub mod resolver;

/// Provenance tag management
pub mod tag;

/// Bounded progress channel
pub mod progress;

/// Cluster → node → VM sync control loop
pub mod orchestrator;

pub use cluster::{
    ClusterMembership, ClusterPool, ClusterSession, ClusterVersion, NodeInfo, VmInfo, VmNetwork,
};
pub use error::{ClusterError, IorError, ResolveError};
pub use ior::{IorSession, MemoryIor};
pub use model::{Record, RecordDescriptor, RecordId, RecordKind};
pub use orchestrator::{ClusterStatus, SessionReport, SyncOptions, SyncOrchestrator, SyncReport, SyncScope};
pub use progress::{ProgressEvent, ProgressSender, ProgressStream};
pub use resolver::{Ensured, Resolution, Resolver};
pub use tag::{ProvenanceTag, TagManager};
