//! In-process store with fault injection, for tests and demos.

use std::collections::BTreeMap;
use std::sync::Mutex;

use intent_core::{ResourceIdentity, ResourceObject, StoreRecord};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{mapping, observe, DeleteOutcome, RecordStore, StoreError};

#[derive(Default)]
struct Inner {
    rows: BTreeMap<i64, StoreRecord>,
    by_identity: FxHashMap<String, i64>,
    next_key: i64,
    fail_next: u32,
    down: bool,
    closed: bool,
    ops: u64,
}

impl Inner {
    fn gate(&mut self, op: &str) -> Result<(), StoreError> {
        self.ops += 1;
        if self.closed {
            return Err(StoreError::Unavailable("store is closed".into()));
        }
        if self.down {
            return Err(StoreError::Unavailable(format!("{}: store is down", op)));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            debug!(op, remaining = self.fail_next, "injected store failure");
            return Err(StoreError::Unavailable(format!("{}: injected failure", op)));
        }
        Ok(())
    }
}

/// Same semantics as the SQLite store, kept in a `BTreeMap` keyed by surrogate key.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Fail the next `n` operations with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut g) = self.inner.lock() { g.fail_next = n; }
    }

    /// Toggle a full outage.
    pub fn set_available(&self, up: bool) {
        if let Ok(mut g) = self.inner.lock() { g.down = !up; }
    }

    /// Operations attempted so far, failed ones included.
    pub fn ops(&self) -> u64 {
        self.inner.lock().map(|g| g.ops).unwrap_or(0)
    }

    /// Direct view of the rows, bypassing fault injection.
    pub fn records(&self) -> Vec<StoreRecord> {
        self.inner.lock().map(|g| g.rows.values().cloned().collect()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn put(&self, obj: &ResourceObject) -> Result<StoreRecord, StoreError> {
        let started = std::time::Instant::now();
        let mut g = self.lock()?;
        g.gate("put")?;
        let key = obj.identity.full_key();
        let rec = match g.by_identity.get(&key).copied() {
            Some(sk) => {
                let cur = g.rows.get(&sk).cloned().ok_or_else(|| StoreError::Corrupt(format!("dangling index for {}", key)))?;
                if cur.resource_version >= obj.resource_version {
                    cur
                } else {
                    let mut next = mapping::object_to_record(obj, sk)?;
                    next.created_at = cur.created_at;
                    g.rows.insert(sk, next.clone());
                    next
                }
            }
            None => {
                g.next_key += 1;
                let sk = g.next_key;
                let rec = mapping::object_to_record(obj, sk)?;
                g.rows.insert(sk, rec.clone());
                g.by_identity.insert(key, sk);
                rec
            }
        };
        observe("put", started);
        Ok(rec)
    }

    async fn get(&self, id: &ResourceIdentity) -> Result<Option<StoreRecord>, StoreError> {
        let started = std::time::Instant::now();
        let mut g = self.lock()?;
        g.gate("get")?;
        let rec = g.by_identity.get(&id.full_key()).and_then(|sk| g.rows.get(sk)).cloned();
        observe("get", started);
        Ok(rec)
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<DeleteOutcome, StoreError> {
        let started = std::time::Instant::now();
        let mut g = self.lock()?;
        g.gate("delete")?;
        let out = match g.by_identity.remove(&id.full_key()) {
            Some(sk) => {
                g.rows.remove(&sk);
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::NotFound,
        };
        observe("delete", started);
        Ok(out)
    }

    async fn list(&self, group: &str, version: &str, namespace: Option<&str>) -> Result<Vec<StoreRecord>, StoreError> {
        let started = std::time::Instant::now();
        let mut g = self.lock()?;
        g.gate("list")?;
        let out = g
            .rows
            .values()
            .filter(|r| r.identity.group == group && r.identity.version == version)
            .filter(|r| namespace.map_or(true, |ns| r.identity.namespace == ns))
            .cloned()
            .collect();
        observe("list", started);
        Ok(out)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.lock()?.closed = true;
        Ok(())
    }
}
