//! Infrastructure-of-record sessions
//!
//! The resolver only needs two calls from the IoR: a unique lookup and a
//! create. Both are fallible; a lookup matching more than one record must be
//! reported as [`IorError::Ambiguous`] rather than picking one. A third,
//! read-only status call serves operators.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::IorError;
use crate::model::{Record, RecordKind, SearchFilter};

/// In-process IoR for dry runs and tests
pub mod memory;

/// NetBox REST client
pub mod netbox;

pub use memory::MemoryIor;
pub use netbox::{NetboxClient, NetboxSettings};

/// Read/create access to the infrastructure-of-record
#[async_trait]
pub trait IorSession: Send + Sync {
    /// Find the single record of `kind` matching `filter`
    async fn find(&self, kind: RecordKind, filter: &SearchFilter) -> Result<Option<Record>, IorError>;

    /// Create a record of `kind` from `fields`
    async fn create(&self, kind: RecordKind, fields: &Map<String, Value>) -> Result<Record, IorError>;

    /// Backend status as the IoR reports it
    async fn status(&self) -> Result<Value, IorError>;
}
