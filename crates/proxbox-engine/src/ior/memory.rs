//! In-process IoR
//!
//! Behaves like the NetBox endpoints the engine uses: unique lookups report
//! ambiguity, slugged endpoints reject duplicate slugs. Faults can be injected
//! per entity type so callers can exercise failure paths.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::IorSession;
use crate::error::IorError;
use crate::model::{Record, RecordId, RecordKind, SearchFilter};

#[derive(Debug, Default)]
struct MemoryState {
    last_id: RecordId,
    records: HashMap<RecordKind, Vec<Record>>,
    failing_finds: HashSet<RecordKind>,
    failing_creates: HashSet<RecordKind>,
    find_calls: usize,
    create_calls: usize,
}

/// IoR held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryIor {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
}

impl MemoryIor {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every lookup, widening the search-then-create window
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every lookup on `kind` fail with a transport error
    pub fn fail_finds(&self, kind: RecordKind) {
        self.lock().failing_finds.insert(kind);
    }

    /// Make every create on `kind` fail with a transport error
    pub fn fail_creates(&self, kind: RecordKind) {
        self.lock().failing_creates.insert(kind);
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.failing_finds.clear();
        state.failing_creates.clear();
    }

    /// Insert a record directly, bypassing call counters and constraints
    pub fn seed(&self, kind: RecordKind, fields: Map<String, Value>) -> Record {
        let mut state = self.lock();
        state.last_id += 1;
        let record = Record::new(state.last_id, fields);
        state.records.entry(kind).or_default().push(record.clone());
        record
    }

    /// Every stored record of `kind`, in creation order
    pub fn records(&self, kind: RecordKind) -> Vec<Record> {
        self.lock().records.get(&kind).cloned().unwrap_or_default()
    }

    /// Number of stored records across all kinds
    pub fn record_count(&self) -> usize {
        self.lock().records.values().map(Vec::len).sum()
    }

    /// Lookups received so far
    pub fn find_calls(&self) -> usize {
        self.lock().find_calls
    }

    /// Creates received so far, including failed ones
    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    /// Every call received so far
    pub fn calls(&self) -> usize {
        let state = self.lock();
        state.find_calls + state.create_calls
    }
}

#[async_trait]
impl IorSession for MemoryIor {
    async fn find(&self, kind: RecordKind, filter: &SearchFilter) -> Result<Option<Record>, IorError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.find_calls += 1;

        if state.failing_finds.contains(&kind) {
            return Err(IorError::Transport(format!("injected lookup fault on {}", kind.path())));
        }

        let mut matches = state
            .records
            .get(&kind)
            .map(|records| records.iter().filter(|r| filter.matches(r)).cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            count => Err(IorError::Ambiguous {
                endpoint: kind.path(),
                filter: filter.to_string(),
                count,
            }),
        }
    }

    async fn create(&self, kind: RecordKind, fields: &Map<String, Value>) -> Result<Record, IorError> {
        let mut state = self.lock();
        state.create_calls += 1;

        if state.failing_creates.contains(&kind) {
            return Err(IorError::Transport(format!("injected create fault on {}", kind.path())));
        }

        if kind.has_slug() {
            let slug = fields.get("slug");
            let taken = state
                .records
                .get(&kind)
                .map(|records| records.iter().any(|r| r.field("slug") == slug))
                .unwrap_or(false);
            if taken {
                return Err(IorError::Status {
                    endpoint: kind.path(),
                    status: 400,
                    message: "slug: record with this slug already exists".to_string(),
                });
            }
        }

        state.last_id += 1;
        let record = Record::new(state.last_id, fields.clone());
        state.records.entry(kind).or_default().push(record.clone());
        Ok(record)
    }

    async fn status(&self) -> Result<Value, IorError> {
        let state = self.lock();
        let records: Map<String, Value> = state
            .records
            .iter()
            .map(|(kind, records)| (kind.path(), Value::from(records.len())))
            .collect();
        Ok(json!({ "backend": "memory", "records": records }))
    }
}
