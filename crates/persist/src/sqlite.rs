//! SQLite-backed store. One connection behind a mutex, so calls for one
//! identity are observed in the order they were made.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use intent_core::{OrgScope, ResourceIdentity, ResourceObject, ResourceVersion, StoreRecord};
use metrics::histogram;
use rusqlite::{Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};

use crate::{mapping, observe, DeleteOutcome, RecordStore, StoreError};

const COLUMNS: &str = "id, org_id, grp, ver, kind, namespace, name, rv, fields, created, updated";

pub struct SqliteStore {
    db: Arc<Mutex<Option<Connection>>>,
    path: String,
}

impl SqliteStore {
    /// Open `INTENT_DB_PATH`, or `intent.db` in the per-user data directory.
    pub fn open_default() -> Result<Self> {
        let path = match std::env::var("INTENT_DB_PATH") {
            Ok(p) => p,
            Err(_) => default_location()?,
        };
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.busy_timeout(std::time::Duration::from_millis(250)).ok();
        Self::init(db, path, started)
    }

    pub fn open_in_memory() -> Result<Self> {
        let started = std::time::Instant::now();
        let db = Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db, ":memory:", started)
    }

    fn init(db: Connection, path: &str, started: std::time::Instant) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS resource (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id    INTEGER NOT NULL,
                grp       TEXT NOT NULL,
                ver       TEXT NOT NULL,
                kind      TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                rv        INTEGER NOT NULL,
                fields    TEXT NOT NULL,
                created   INTEGER NOT NULL,
                updated   INTEGER NOT NULL
            )",
            [],
        )
        .context("creating resource table")?;
        db.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_identity ON resource(grp, ver, kind, namespace, name)",
            [],
        )
        .context("creating identity index")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path, "sqlite store opened");
        Ok(Self { db: Arc::new(Mutex::new(Some(db))), path: path.to_string() })
    }

    pub fn path(&self) -> &str { &self.path }

    /// Run `f` on the blocking pool with the connection held.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            let conn = guard.as_mut().ok_or_else(|| StoreError::Unavailable("store is closed".into()))?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {}", e)))?
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
                StoreError::Corrupt(e.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

fn identity_params(id: &ResourceIdentity) -> [&str; 5] {
    [&id.group, &id.version, &id.kind, &id.namespace, &id.name]
}

fn select_one(tx: &Transaction<'_>, id: &ResourceIdentity) -> Result<Option<StoreRecord>, StoreError> {
    let sql = format!(
        "SELECT {} FROM resource WHERE grp = ?1 AND ver = ?2 AND kind = ?3 AND namespace = ?4 AND name = ?5",
        COLUMNS
    );
    let raw = tx.query_row(&sql, identity_params(id), RawRow::read).optional()?;
    raw.map(RawRow::decode).transpose()
}

/// Row as read from sqlite; decoded outside the rusqlite closure so JSON
/// errors map to `Corrupt`.
struct RawRow {
    id: i64,
    org_id: i64,
    grp: String,
    ver: String,
    kind: String,
    namespace: String,
    name: String,
    rv: i64,
    fields: String,
    created: i64,
    updated: i64,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            org_id: row.get(1)?,
            grp: row.get(2)?,
            ver: row.get(3)?,
            kind: row.get(4)?,
            namespace: row.get(5)?,
            name: row.get(6)?,
            rv: row.get(7)?,
            fields: row.get(8)?,
            created: row.get(9)?,
            updated: row.get(10)?,
        })
    }

    fn decode(self) -> Result<StoreRecord, StoreError> {
        let fields = serde_json::from_str(&self.fields)
            .map_err(|e| StoreError::Corrupt(format!("row {}: fields: {}", self.id, e)))?;
        Ok(StoreRecord {
            surrogate_key: self.id,
            org_scope: OrgScope(self.org_id),
            identity: ResourceIdentity {
                group: self.grp,
                version: self.ver,
                kind: self.kind,
                namespace: self.namespace,
                name: self.name,
            },
            resource_version: ResourceVersion(self.rv as u64),
            fields,
            created_at: self.created,
            updated_at: self.updated,
        })
    }
}

#[async_trait::async_trait]
impl RecordStore for SqliteStore {
    async fn put(&self, obj: &ResourceObject) -> Result<StoreRecord, StoreError> {
        let started = std::time::Instant::now();
        let desired = mapping::object_to_record(obj, 0)?;
        let fields = serde_json::to_string(&desired.fields).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let rec = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let id = &desired.identity;
                let existing: Option<(i64, i64)> = tx
                    .query_row(
                        "SELECT id, rv FROM resource WHERE grp = ?1 AND ver = ?2 AND kind = ?3 AND namespace = ?4 AND name = ?5",
                        identity_params(id),
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                let rv = desired.resource_version.0 as i64;
                match existing {
                    Some((key, cur)) if cur >= rv => {
                        debug!(key, cur, rv, id = %id, "put is a no-op: version already applied");
                    }
                    Some((key, _)) => {
                        tx.execute(
                            "UPDATE resource SET org_id = ?1, rv = ?2, fields = ?3, updated = ?4 WHERE id = ?5",
                            (desired.org_scope.0, rv, &fields, desired.updated_at, key),
                        )?;
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO resource(org_id, grp, ver, kind, namespace, name, rv, fields, created, updated)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                            (
                                desired.org_scope.0,
                                &id.group,
                                &id.version,
                                &id.kind,
                                &id.namespace,
                                &id.name,
                                rv,
                                &fields,
                                desired.created_at,
                                desired.updated_at,
                            ),
                        )?;
                    }
                }
                let rec = select_one(&tx, id)?
                    .ok_or_else(|| StoreError::Corrupt(format!("row for {} vanished inside its transaction", id)))?;
                tx.commit()?;
                Ok(rec)
            })
            .await?;
        observe("put", started);
        Ok(rec)
    }

    async fn get(&self, id: &ResourceIdentity) -> Result<Option<StoreRecord>, StoreError> {
        let started = std::time::Instant::now();
        let id = id.clone();
        let rec = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let rec = select_one(&tx, &id)?;
                tx.commit()?;
                Ok(rec)
            })
            .await?;
        observe("get", started);
        Ok(rec)
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<DeleteOutcome, StoreError> {
        let started = std::time::Instant::now();
        let id = id.clone();
        let n = self
            .with_conn(move |conn| {
                let n = conn.execute(
                    "DELETE FROM resource WHERE grp = ?1 AND ver = ?2 AND kind = ?3 AND namespace = ?4 AND name = ?5",
                    identity_params(&id),
                )?;
                Ok(n)
            })
            .await?;
        observe("delete", started);
        Ok(if n > 0 { DeleteOutcome::Deleted } else { DeleteOutcome::NotFound })
    }

    async fn list(&self, group: &str, version: &str, namespace: Option<&str>) -> Result<Vec<StoreRecord>, StoreError> {
        let started = std::time::Instant::now();
        let (group, version, namespace) = (group.to_string(), version.to_string(), namespace.map(|s| s.to_string()));
        let raws = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {} FROM resource WHERE grp = ?1 AND ver = ?2 AND (?3 IS NULL OR namespace = ?3) ORDER BY id ASC",
                    COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map((&group, &version, &namespace), RawRow::read)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        let out = raws.into_iter().map(RawRow::decode).collect::<Result<Vec<_>, _>>()?;
        observe("list", started);
        Ok(out)
    }

    async fn close(&self) -> Result<(), StoreError> {
        let db = Arc::clone(&self.db);
        let closed = tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let mut guard = db.lock().map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            match guard.take() {
                Some(conn) => {
                    conn.close().map_err(|(_, e)| StoreError::from(e))?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {}", e)))??;
        if closed {
            info!(path = %self.path, "sqlite store closed");
        }
        Ok(())
    }
}

/// `$XDG_DATA_HOME/intent`, then `~/.intent`, then the working directory.
fn default_location() -> Result<String> {
    let dir = match (std::env::var_os("XDG_DATA_HOME"), std::env::var_os("HOME")) {
        (Some(data), _) => std::path::PathBuf::from(data).join("intent"),
        (None, Some(home)) => std::path::PathBuf::from(home).join(".intent"),
        (None, None) => return Ok("intent.db".to_string()),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("creating data directory {}", dir.display()))?;
    Ok(dir.join("intent.db").to_string_lossy().into_owned())
}
