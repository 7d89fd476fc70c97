//! Get-or-create over record descriptors
//!
//! [`Resolver::ensure`] is the single read-or-create primitive used for every
//! entity type: look the record up by its descriptor's key, and only when it
//! is absent resolve the dependency fields and create it with the provenance
//! tag attached. Completed results are memoized for the lifetime of the
//! resolver, which is one sync run.
//!
//! The lookup and the create are not locked together. Two callers racing on
//! the same key can both miss the lookup and both create.

use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{IorError, ResolveError};
use crate::ior::IorSession;
use crate::model::{Dependency, DependencyPolicy, Record, RecordDescriptor, RecordId, RecordKey, RecordKind};
use crate::tag::{ProvenanceTag, TagManager};

/// A record returned by [`Resolver::ensure`]
#[derive(Debug, Clone, PartialEq)]
pub struct Ensured {
    /// The IoR record
    pub record: Record,
    /// Whether this call created it
    pub created: bool,
}

impl Ensured {
    /// Record id
    pub fn id(&self) -> RecordId {
        self.record.id
    }
}

/// Outcome of resolving one dependency field
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The requested record was found or created
    Resolved(Ensured),
    /// The requested record was absent or failed; the default was used
    Fallback {
        /// The default record
        ensured: Ensured,
        /// Why the requested record was not used
        reason: String,
    },
    /// No usable id
    Missing(String),
}

impl Resolution {
    /// Id to submit for the field, if any
    pub fn id(&self) -> Option<RecordId> {
        self.ensured().map(Ensured::id)
    }

    /// The record behind the resolution, if any
    pub fn ensured(&self) -> Option<&Ensured> {
        match self {
            Resolution::Resolved(ensured) | Resolution::Fallback { ensured, .. } => Some(ensured),
            Resolution::Missing(_) => None,
        }
    }

    /// Check if the default record was used
    pub fn is_fallback(&self) -> bool {
        matches!(self, Resolution::Fallback { .. })
    }
}

/// One resolved dependency field
#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    /// Field name on the dependent record
    pub field: &'static str,
    /// Entity type the field points at
    pub kind: Option<RecordKind>,
    /// Name of the requested (or default) record
    pub name: Option<String>,
    /// Outcome
    pub resolution: Resolution,
}

/// Dependency outcomes of one descriptor, in declaration order
#[derive(Debug, Clone, Default)]
pub struct DependencySet {
    entries: Vec<ResolvedDependency>,
}

impl DependencySet {
    /// Entries in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedDependency> {
        self.entries.iter()
    }

    /// First dependency without a usable id
    pub fn missing(&self) -> Option<&ResolvedDependency> {
        self.entries
            .iter()
            .find(|entry| matches!(entry.resolution, Resolution::Missing(_)))
    }

    /// Outcome for one field
    pub fn get(&self, field: &str) -> Option<&Resolution> {
        self.entries
            .iter()
            .find(|entry| entry.field == field)
            .map(|entry| &entry.resolution)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the descriptor has no dependencies
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-run get-or-create engine shared by every sync branch
pub struct Resolver {
    ior: Arc<dyn IorSession>,
    tags: TagManager,
    memo: Mutex<HashMap<RecordKey, Record>>,
    call_timeout: Duration,
}

impl Resolver {
    /// Create a resolver with an empty memo
    pub fn new(ior: Arc<dyn IorSession>, call_timeout: Duration) -> Self {
        Self {
            ior,
            tags: TagManager::new(),
            memo: Mutex::new(HashMap::new()),
            call_timeout,
        }
    }

    /// Timeout applied to each IoR call
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn memo(&self) -> MutexGuard<'_, HashMap<RecordKey, Record>> {
        self.memo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of memoized records
    pub fn memoized(&self) -> usize {
        self.memo().len()
    }

    async fn call<T>(&self, future: impl Future<Output = Result<T, IorError>>) -> Result<T, IorError> {
        tokio::time::timeout(self.call_timeout, future)
            .await
            .map_err(|_| IorError::Timeout(self.call_timeout))?
    }

    /// Ensure the provenance tag exists; memoized on success only
    pub async fn provenance_tag(&self) -> Result<ProvenanceTag, ResolveError> {
        self.tags.ensure_provenance_tag(self).await
    }

    /// Find the record described by `descriptor`, creating it (and its
    /// dependencies) when absent
    pub fn ensure<'a>(
        &'a self,
        descriptor: &'a RecordDescriptor,
    ) -> BoxFuture<'a, Result<Ensured, ResolveError>> {
        async move {
            if let Some(existing) = self.lookup(descriptor).await? {
                return Ok(existing);
            }
            let dependencies = self.build_dependencies(descriptor).await;
            self.create_with(descriptor, &dependencies).await
        }
        .boxed()
    }

    /// Like [`Resolver::ensure`], with dependencies already resolved by the
    /// caller through [`Resolver::build_dependencies`]
    pub async fn ensure_with(
        &self,
        descriptor: &RecordDescriptor,
        dependencies: &DependencySet,
    ) -> Result<Ensured, ResolveError> {
        if let Some(existing) = self.lookup(descriptor).await? {
            return Ok(existing);
        }
        self.create_with(descriptor, dependencies).await
    }

    /// Resolve every dependency field of `descriptor`, in order
    pub async fn build_dependencies(&self, descriptor: &RecordDescriptor) -> DependencySet {
        let mut entries = Vec::with_capacity(descriptor.dependencies.len());
        for dependency in &descriptor.dependencies {
            let resolution = self.resolve_dependency(dependency).await;
            entries.push(ResolvedDependency {
                field: dependency.field,
                kind: dependency.kind(),
                name: dependency.target_name().map(str::to_string),
                resolution,
            });
        }
        DependencySet { entries }
    }

    /// Resolve one dependency field according to its policy
    pub async fn resolve_dependency(&self, dependency: &Dependency) -> Resolution {
        let primary = match &dependency.target {
            Some(target) => self.ensure(target).await.map_err(|e| e.to_string()),
            None => Err(format!("no {} reported", dependency.field)),
        };

        match (primary, &dependency.policy) {
            (Ok(ensured), _) => Resolution::Resolved(ensured),
            (Err(reason), DependencyPolicy::Required) => Resolution::Missing(reason),
            (Err(reason), DependencyPolicy::WithFallback(fallback)) => {
                warn!(
                    "Falling back to {} '{}' for {}: {}",
                    fallback.display_name(),
                    fallback.name(),
                    dependency.field,
                    reason
                );
                match self.ensure(fallback).await {
                    Ok(ensured) => Resolution::Fallback { ensured, reason },
                    Err(e) => Resolution::Missing(format!("{reason}; fallback failed: {e}")),
                }
            }
        }
    }

    async fn lookup(&self, descriptor: &RecordDescriptor) -> Result<Option<Ensured>, ResolveError> {
        let key = descriptor.key();
        let cached = self.memo().get(&key).cloned();
        if let Some(record) = cached {
            return Ok(Some(Ensured {
                record,
                created: false,
            }));
        }

        let filter = descriptor.search_filter();
        debug!("Looking up {} '{}' ({})", descriptor.display_name(), descriptor.name(), filter);
        let found = self
            .call(self.ior.find(descriptor.kind, &filter))
            .await
            .map_err(|e| ResolveError::from_ior(descriptor.display_name(), descriptor.name(), e))?;

        Ok(found.map(|record| {
            self.memo().insert(key, record.clone());
            Ensured {
                record,
                created: false,
            }
        }))
    }

    async fn create_with(
        &self,
        descriptor: &RecordDescriptor,
        dependencies: &DependencySet,
    ) -> Result<Ensured, ResolveError> {
        if let Some(missing) = dependencies.missing() {
            let reason = match &missing.resolution {
                Resolution::Missing(reason) => reason.clone(),
                _ => String::new(),
            };
            return Err(ResolveError::MissingDependency {
                display: descriptor.display_name(),
                name: descriptor.name().to_string(),
                field: missing.field,
                reason,
            });
        }

        let mut fields: Map<String, Value> = descriptor.base_fields();
        for entry in dependencies.iter() {
            if let Some(id) = entry.resolution.id() {
                fields.insert(entry.field.to_string(), Value::from(id));
            }
        }

        if descriptor.kind != RecordKind::Tag {
            let tag = self.provenance_tag().await.map_err(|e| ResolveError::Tag {
                display: descriptor.display_name(),
                name: descriptor.name().to_string(),
                reason: e.to_string(),
            })?;
            fields.insert("tags".to_string(), Value::from(vec![tag.id]));
        }

        let record = self
            .call(self.ior.create(descriptor.kind, &fields))
            .await
            .map_err(|e| ResolveError::from_ior(descriptor.display_name(), descriptor.name(), e))?;

        info!("Created {} '{}' (id {})", descriptor.display_name(), descriptor.name(), record.id);
        self.memo().insert(descriptor.key(), record.clone());
        Ok(Ensured {
            record,
            created: true,
        })
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("memoized", &self.memoized())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}
