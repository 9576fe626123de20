//! Intent persistence: the resource store adapter.
//!
//! Maps declarative objects (namespace/name identity) onto relational rows
//! (surrogate key + org scope) and performs CRUD against the backing store.
//! Store unavailability is surfaced as [`StoreError::Unavailable`] and left to
//! the caller to retry.

#![forbid(unsafe_code)]

use intent_core::{ResourceIdentity, ResourceObject, StoreRecord, ValidationError};
use serde::{Deserialize, Serialize};

mod mapping;
mod memory;
mod sqlite;

pub use mapping::{flatten_spec, object_to_record, record_to_object, unflatten_fields};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient: the backing store could not be reached or is busy.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl StoreError {
    pub fn is_transient(&self) -> bool { matches!(self, StoreError::Unavailable(_)) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// CRUD surface of the backing store. The only component that generates or
/// dereferences surrogate keys.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or update the row for the object's identity.
    ///
    /// A row already carrying a version `>=` the object's is left untouched and
    /// returned, so retried puts never duplicate or regress.
    async fn put(&self, obj: &ResourceObject) -> Result<StoreRecord, StoreError>;

    /// Exact-match lookup; `None` when absent.
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<StoreRecord>, StoreError>;

    /// Remove the row; `NotFound` when it was already absent.
    async fn delete(&self, id: &ResourceIdentity) -> Result<DeleteOutcome, StoreError>;

    /// Rows of one group/version (optionally one namespace), by surrogate key ascending.
    async fn list(&self, group: &str, version: &str, namespace: Option<&str>) -> Result<Vec<StoreRecord>, StoreError>;

    /// End of lifecycle. Later calls fail with `Unavailable`.
    async fn close(&self) -> Result<(), StoreError> { Ok(()) }
}

pub(crate) fn observe(op: &'static str, started: std::time::Instant) {
    let ms = started.elapsed().as_secs_f64() * 1000.0;
    match op {
        "put" => { metrics::histogram!("persist_put_ms", ms); metrics::counter!("persist_put_total", 1u64); }
        "get" => { metrics::histogram!("persist_get_ms", ms); }
        "delete" => { metrics::histogram!("persist_delete_ms", ms); metrics::counter!("persist_delete_total", 1u64); }
        _ => { metrics::histogram!("persist_list_ms", ms); }
    }
}
