// ABOUTME: SQLite-backed local store holding entities, their secondary index rows, and the change queue.
// ABOUTME: Every entity write and the queue entry it implies commit together in a single transaction.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use fieldsync_core::change::ParseEnumError;
use fieldsync_core::{
    ChangeKind, Clock, CollectionDef, Connectivity, Entity, PendingChange, RetryPolicy, Schema,
    SyncStatus,
};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params, params_from_iter};
use thiserror::Error;
use ulid::Ulid;

use crate::journal::JournalError;
use crate::queue::insert_change;

/// Errors that can occur during local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage medium refused the write (disk full, quota). Never retried automatically.
    #[error("storage full: {0}")]
    StorageFull(String),

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("invalid stored value: {0}")]
    InvalidValue(#[from] ParseEnumError),

    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("unknown index {index} on collection {collection}")]
    UnknownIndex { collection: String, index: String },

    #[error("unique index {index} on {collection} already maps {key} to entity {existing}")]
    UniqueViolation {
        collection: String,
        index: String,
        key: String,
        existing: String,
    },

    #[error("pending change not found: {0}")]
    ChangeNotFound(Ulid),

    #[error("pending change {0} is not active")]
    ChangeNotActive(Ulid),

    #[error("pending change {0} is still active")]
    ChangeStillActive(Ulid),

    #[error("pending change {0} is older than a change the remote already accepted for the same entity")]
    ChangeSuperseded(Ulid),

    #[error("store actor closed")]
    ActorClosed,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::DiskFull => {
                StoreError::StorageFull(err.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Result of a `put`: the entity as persisted and the change it queued, if any.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    pub entity: Entity,
    pub kind: ChangeKind,
    pub change_id: Option<Ulid>,
}

/// Result of a `delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteReceipt {
    pub existed: bool,
    pub change_id: Option<Ulid>,
}

/// Optional narrowing for `list`. An empty filter returns the whole collection.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub sync_status: Option<SyncStatus>,
    pub index: Option<(String, String)>,
    pub modified_since: Option<DateTime<Utc>>,
}

impl EntityFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = Some(status);
        self
    }

    pub fn with_index(mut self, index: impl Into<String>, key: impl Into<String>) -> Self {
        self.index = Some((index.into(), key.into()));
        self
    }

    pub fn modified_since(mut self, at: DateTime<Utc>) -> Self {
        self.modified_since = Some(at);
        self
    }
}

/// Durable local store for one client. Owns the SQLite connection, the
/// collection schema, the injected clock, and the retry policy the queue applies.
pub struct LocalStore {
    pub(crate) conn: Connection,
    pub(crate) schema: Schema,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) policy: RetryPolicy,
}

impl LocalStore {
    /// Open or create a store database at the given path and run migrations.
    pub fn open(
        path: &Path,
        schema: Schema,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=FULL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                sync_status TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            );

            CREATE TABLE IF NOT EXISTS entity_index (
                entity_type TEXT NOT NULL,
                index_name TEXT NOT NULL,
                key TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                PRIMARY KEY (entity_type, index_name, key, entity_id)
            );

            CREATE INDEX IF NOT EXISTS entity_index_by_entity
                ON entity_index (entity_type, entity_id);

            CREATE TABLE IF NOT EXISTS pending_changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                change_id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'active',
                next_attempt_at TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS pending_changes_by_target
                ON pending_changes (entity_type, entity_id, state);

            -- Queue position of the latest change the remote accepted, per entity
            CREATE TABLE IF NOT EXISTS acknowledged (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                seq INTEGER NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            conn,
            schema,
            clock,
            policy,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Upsert an entity. Stamps `last_modified` from the clock and derives
    /// `sync_status` from connectivity. Offline writes, and writes to an entity
    /// that still has queued changes, enqueue a change in the same transaction.
    pub fn put(
        &mut self,
        entity_type: &str,
        mut entity: Entity,
        connectivity: Connectivity,
    ) -> Result<WriteReceipt, StoreError> {
        let collection = lookup_collection(&self.schema, entity_type)?;
        let now = self.clock.now();

        let tx = self.conn.transaction()?;
        let existed = entity_exists(&tx, entity_type, &entity.id)?;
        let queued_before = active_changes_for(&tx, entity_type, &entity.id)?;
        let enqueue = !connectivity.is_online() || queued_before > 0;

        entity.last_modified = now;
        entity.sync_status = if enqueue {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };

        tx.execute(
            "INSERT INTO entities (entity_type, entity_id, payload, last_modified, sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                payload = excluded.payload,
                last_modified = excluded.last_modified,
                sync_status = excluded.sync_status",
            params![
                entity_type,
                entity.id,
                serde_json::to_string(&entity.payload)?,
                ts(now),
                entity.sync_status.as_str(),
            ],
        )?;
        write_index_rows(&tx, collection, &entity)?;

        let kind = if existed {
            ChangeKind::Update
        } else {
            ChangeKind::Create
        };
        let change_id = if enqueue {
            let change = PendingChange::new(
                kind,
                entity_type,
                entity.id.as_str(),
                entity.payload.clone(),
                now,
            );
            insert_change(&tx, &change, now)?;
            Some(change.id)
        } else {
            None
        };

        tx.commit()?;

        tracing::debug!(
            "put {}/{} as {} ({}, queued: {})",
            entity_type,
            entity.id,
            entity.sync_status,
            kind,
            change_id.is_some()
        );

        Ok(WriteReceipt {
            entity,
            kind,
            change_id,
        })
    }

    /// Delete an entity and its index rows. Queues a `delete` change under the
    /// same rules as `put`. Deleting a missing entity is a no-op.
    pub fn delete(
        &mut self,
        entity_type: &str,
        id: &str,
        connectivity: Connectivity,
    ) -> Result<DeleteReceipt, StoreError> {
        lookup_collection(&self.schema, entity_type)?;
        let now = self.clock.now();

        let tx = self.conn.transaction()?;
        let Some(existing) = load_entity(&tx, entity_type, id)? else {
            return Ok(DeleteReceipt {
                existed: false,
                change_id: None,
            });
        };
        let enqueue =
            !connectivity.is_online() || active_changes_for(&tx, entity_type, id)? > 0;

        tx.execute(
            "DELETE FROM entity_index WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type, id],
        )?;
        tx.execute(
            "DELETE FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type, id],
        )?;

        let change_id = if enqueue {
            let change =
                PendingChange::new(ChangeKind::Delete, entity_type, id, existing.payload, now);
            insert_change(&tx, &change, now)?;
            Some(change.id)
        } else {
            None
        };

        tx.commit()?;

        Ok(DeleteReceipt {
            existed: true,
            change_id,
        })
    }

    /// Fetch one entity by id.
    pub fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, StoreError> {
        lookup_collection(&self.schema, entity_type)?;
        load_entity(&self.conn, entity_type, id)
    }

    /// All entities whose declared index holds `key`.
    pub fn get_by_index(
        &self,
        entity_type: &str,
        index_name: &str,
        key: &str,
    ) -> Result<Vec<Entity>, StoreError> {
        self.list(entity_type, &EntityFilter::all().with_index(index_name, key))
    }

    /// The single entity a lookup key resolves to, e.g. a migrant by QR code.
    pub fn find_unique(
        &self,
        entity_type: &str,
        index_name: &str,
        key: &str,
    ) -> Result<Option<Entity>, StoreError> {
        Ok(self
            .get_by_index(entity_type, index_name, key)?
            .into_iter()
            .next())
    }

    /// Latest local state of a collection, optionally filtered.
    pub fn list(&self, entity_type: &str, filter: &EntityFilter) -> Result<Vec<Entity>, StoreError> {
        let collection = lookup_collection(&self.schema, entity_type)?;

        let mut sql = String::from(
            "SELECT e.entity_id, e.payload, e.last_modified, e.sync_status
             FROM entities e WHERE e.entity_type = ?1",
        );
        let mut args: Vec<String> = vec![entity_type.to_string()];

        if let Some(status) = filter.sync_status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND e.sync_status = ?{}", args.len()));
        }

        if let Some((index_name, key)) = &filter.index {
            if collection.index(index_name).is_none() {
                return Err(StoreError::UnknownIndex {
                    collection: entity_type.to_string(),
                    index: index_name.clone(),
                });
            }
            args.push(index_name.clone());
            let name_pos = args.len();
            args.push(key.clone());
            sql.push_str(&format!(
                " AND e.entity_id IN (SELECT i.entity_id FROM entity_index i
                   WHERE i.entity_type = e.entity_type AND i.index_name = ?{} AND i.key = ?{})",
                name_pos,
                args.len()
            ));
        }

        if let Some(since) = filter.modified_since {
            args.push(ts(since));
            sql.push_str(&format!(" AND e.last_modified >= ?{}", args.len()));
        }

        sql.push_str(" ORDER BY e.last_modified ASC, e.entity_id ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), raw_entity)?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(entity_from_raw(row?)?);
        }
        Ok(entities)
    }

    /// Flip an entity to `synced` unless it still has active queued changes.
    /// Returns whether the status changed.
    pub fn mark_synced(&mut self, entity_type: &str, id: &str) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let changed = mark_synced_if_drained(&tx, entity_type, id)?;
        tx.commit()?;
        Ok(changed)
    }

    /// Drop and rebuild every index row from the entities table. Entities of
    /// collections absent from the schema are kept but not indexed.
    pub fn rebuild_indexes(&mut self) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM entity_index", [])?;

        let mut indexed = 0;
        for collection in self.schema.collections() {
            let entities = {
                let mut stmt = tx.prepare(
                    "SELECT entity_id, payload, last_modified, sync_status
                     FROM entities WHERE entity_type = ?1",
                )?;
                let rows = stmt.query_map(params![collection.name], raw_entity)?;
                let mut entities = Vec::new();
                for row in rows {
                    entities.push(entity_from_raw(row?)?);
                }
                entities
            };

            for entity in &entities {
                write_index_rows(&tx, collection, entity)?;
            }
            indexed += entities.len();
        }

        set_meta(&tx, "schema_fingerprint", &self.schema.fingerprint())?;
        tx.commit()?;
        Ok(indexed)
    }

    /// Number of entities stored for collections the schema no longer declares.
    pub fn orphaned_entity_count(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        let mut stmt = self
            .conn
            .prepare("SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (entity_type, n) = row?;
            if self.schema.collection(&entity_type).is_none() {
                count += n as usize;
            }
        }
        Ok(count)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        set_meta(&self.conn, key, value)
    }

    /// Run SQLite's quick integrity check.
    pub fn integrity_check(&self) -> Result<bool, StoreError> {
        let result: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }
}

/// Render a timestamp in a fixed-width RFC 3339 form so text order matches time order.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn lookup_collection<'a>(schema: &'a Schema, name: &str) -> Result<&'a CollectionDef, StoreError> {
    schema
        .collection(name)
        .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
}

type RawEntity = (String, String, String, String);

fn raw_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntity> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn entity_from_raw(raw: RawEntity) -> Result<Entity, StoreError> {
    let (id, payload, last_modified, sync_status) = raw;
    Ok(Entity {
        id,
        payload: serde_json::from_str(&payload)?,
        last_modified: parse_ts(&last_modified)?,
        sync_status: sync_status.parse()?,
    })
}

fn load_entity(conn: &Connection, entity_type: &str, id: &str) -> Result<Option<Entity>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT entity_id, payload, last_modified, sync_status
             FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type, id],
            raw_entity,
        )
        .optional()?;
    raw.map(entity_from_raw).transpose()
}

fn entity_exists(conn: &Connection, entity_type: &str, id: &str) -> Result<bool, StoreError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type, id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

pub(crate) fn active_changes_for(
    conn: &Connection,
    entity_type: &str,
    id: &str,
) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_changes
         WHERE entity_type = ?1 AND entity_id = ?2 AND state = 'active'",
        params![entity_type, id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

pub(crate) fn mark_synced_if_drained(
    conn: &Connection,
    entity_type: &str,
    id: &str,
) -> Result<bool, StoreError> {
    if active_changes_for(conn, entity_type, id)? > 0 {
        return Ok(false);
    }
    let updated = conn.execute(
        "UPDATE entities SET sync_status = 'synced'
         WHERE entity_type = ?1 AND entity_id = ?2 AND sync_status != 'synced'",
        params![entity_type, id],
    )?;
    Ok(updated > 0)
}

/// Replace the index rows of one entity, enforcing declared-unique indexes.
fn write_index_rows(
    conn: &Connection,
    collection: &CollectionDef,
    entity: &Entity,
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM entity_index WHERE entity_type = ?1 AND entity_id = ?2",
        params![collection.name, entity.id],
    )?;

    for index in &collection.indexes {
        for key in index.keys(entity) {
            if index.unique {
                let holder: Option<String> = conn
                    .query_row(
                        "SELECT entity_id FROM entity_index
                         WHERE entity_type = ?1 AND index_name = ?2 AND key = ?3 AND entity_id != ?4
                         LIMIT 1",
                        params![collection.name, index.name, key, entity.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(existing) = holder {
                    return Err(StoreError::UniqueViolation {
                        collection: collection.name.clone(),
                        index: index.name.clone(),
                        key,
                        existing,
                    });
                }
            }

            conn.execute(
                "INSERT OR IGNORE INTO entity_index (entity_type, index_name, key, entity_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![collection.name, index.name, key, entity.id],
            )?;
        }
    }

    Ok(())
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
