//! Provenance tag
//!
//! Every record the engine creates carries one well-known tag. The tag is
//! looked up (and created if absent) through the same resolver as any other
//! record; the manager only adds a per-run memo that keeps success and
//! forgets failure.

use serde::Serialize;
use tokio::sync::OnceCell;

use crate::catalog;
use crate::error::ResolveError;
use crate::model::{Record, RecordId};
use crate::resolver::Resolver;

/// The tag marking engine-owned records
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvenanceTag {
    /// IoR id
    pub id: RecordId,
    /// Tag name
    pub name: String,
    /// Tag slug
    pub slug: String,
    /// Hex color without `#`
    pub color: Option<String>,
}

impl From<&Record> for ProvenanceTag {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id,
            name: record.str_field("name").unwrap_or(catalog::TAG_NAME).to_string(),
            slug: record.str_field("slug").unwrap_or(catalog::TAG_SLUG).to_string(),
            color: record.str_field("color").map(str::to_string),
        }
    }
}

/// Per-run memo of the provenance tag
#[derive(Debug, Default)]
pub struct TagManager {
    tag: OnceCell<ProvenanceTag>,
}

impl TagManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag ensured earlier in this run, if any
    pub fn cached(&self) -> Option<&ProvenanceTag> {
        self.tag.get()
    }

    /// Find or create the provenance tag. Concurrent callers share a single
    /// attempt; a failed attempt is not remembered.
    pub async fn ensure_provenance_tag(&self, resolver: &Resolver) -> Result<ProvenanceTag, ResolveError> {
        self.tag
            .get_or_try_init(|| async move {
                let descriptor = catalog::provenance_tag();
                let ensured = resolver.ensure(&descriptor).await?;
                Ok(ProvenanceTag::from(&ensured.record))
            })
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ior::MemoryIor;
    use crate::model::RecordKind;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn tag_is_created_once_with_fixed_identity() {
        let ior = Arc::new(MemoryIor::new());
        let resolver = Resolver::new(ior.clone(), Duration::from_secs(5));
        let manager = TagManager::new();

        let first = manager.ensure_provenance_tag(&resolver).await.expect("tag");
        let second = manager.ensure_provenance_tag(&resolver).await.expect("tag");

        assert_eq!(first, second);
        assert_eq!(first.name, "Proxbox");
        assert_eq!(first.slug, "proxbox");
        assert_eq!(first.color.as_deref(), Some("ff5722"));
        assert_eq!(ior.records(RecordKind::Tag).len(), 1);
        assert_eq!(manager.cached(), Some(&first));
    }

    #[tokio::test]
    async fn failure_is_not_memoized() {
        let ior = Arc::new(MemoryIor::new());
        let resolver = Resolver::new(ior.clone(), Duration::from_secs(5));
        let manager = TagManager::new();
        ior.fail_finds(RecordKind::Tag);

        assert!(manager.ensure_provenance_tag(&resolver).await.is_err());
        assert!(manager.cached().is_none());

        ior.clear_faults();
        assert!(manager.ensure_provenance_tag(&resolver).await.is_ok());
    }
}
