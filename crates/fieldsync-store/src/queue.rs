// ABOUTME: Durable FIFO queue of pending changes living beside the entities in the local store.
// ABOUTME: Handles acknowledgment, backoff scheduling, abandonment, rejection, and operator actions on parked changes.

use chrono::{DateTime, Utc};
use fieldsync_core::{ChangeKind, ChangeState, PendingChange};
use rusqlite::{Connection, OptionalExtension, params};
use ulid::Ulid;

use crate::sqlite::{LocalStore, StoreError, mark_synced_if_drained, parse_ts, ts};

/// What `requeue_with_backoff` did with a transiently failed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Still active; the next attempt is gated until `next_attempt_at`.
    Scheduled {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retry bound reached; parked as abandoned.
    Abandoned { retry_count: u32 },
}

const CHANGE_COLUMNS: &str = "change_id, kind, entity_type, entity_id, payload, created_at, \
     retry_count, state, next_attempt_at, last_error";

struct RawChange {
    change_id: String,
    kind: String,
    entity_type: String,
    entity_id: String,
    payload: String,
    created_at: String,
    retry_count: u32,
    state: String,
    next_attempt_at: Option<String>,
    last_error: Option<String>,
}

fn raw_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawChange> {
    Ok(RawChange {
        change_id: row.get(0)?,
        kind: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        payload: row.get(4)?,
        created_at: row.get(5)?,
        retry_count: row.get(6)?,
        state: row.get(7)?,
        next_attempt_at: row.get(8)?,
        last_error: row.get(9)?,
    })
}

fn change_from_raw(raw: RawChange) -> Result<PendingChange, StoreError> {
    let id = Ulid::from_string(&raw.change_id)
        .map_err(|_| fieldsync_core::ParseEnumError::new("change id", &raw.change_id))?;
    Ok(PendingChange {
        id,
        kind: raw.kind.parse()?,
        entity_type: raw.entity_type,
        entity_id: raw.entity_id,
        payload: serde_json::from_str(&raw.payload)?,
        created_at: parse_ts(&raw.created_at)?,
        retry_count: raw.retry_count,
        state: raw.state.parse()?,
        next_attempt_at: raw.next_attempt_at.as_deref().map(parse_ts).transpose()?,
        last_error: raw.last_error,
    })
}

pub(crate) fn insert_change(
    conn: &Connection,
    change: &PendingChange,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO pending_changes
            (change_id, kind, entity_type, entity_id, payload, created_at,
             retry_count, state, next_attempt_at, last_error, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            change.id.to_string(),
            change.kind.as_str(),
            change.entity_type,
            change.entity_id,
            serde_json::to_string(&change.payload)?,
            ts(change.created_at),
            change.retry_count,
            change.state.as_str(),
            change.next_attempt_at.map(ts),
            change.last_error,
            ts(now),
        ],
    )?;
    Ok(())
}

fn load_change(conn: &Connection, id: Ulid) -> Result<Option<PendingChange>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {CHANGE_COLUMNS} FROM pending_changes WHERE change_id = ?1"),
            params![id.to_string()],
            raw_change,
        )
        .optional()?;
    raw.map(change_from_raw).transpose()
}

fn select_changes(conn: &Connection, where_clause: &str) -> Result<Vec<PendingChange>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANGE_COLUMNS} FROM pending_changes WHERE {where_clause}
         ORDER BY created_at ASC, seq ASC"
    ))?;
    let rows = stmt.query_map([], raw_change)?;

    let mut changes = Vec::new();
    for row in rows {
        changes.push(change_from_raw(row?)?);
    }
    Ok(changes)
}

impl LocalStore {
    /// Append a change for an entity outside of `put`/`delete`. The entity,
    /// if present, is flipped to pending in the same transaction.
    pub fn enqueue(
        &mut self,
        kind: ChangeKind,
        entity_type: &str,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<Ulid, StoreError> {
        let now = self.clock.now();
        let change = PendingChange::new(kind, entity_type, entity_id, payload, now);

        let tx = self.conn.transaction()?;
        insert_change(&tx, &change, now)?;
        tx.execute(
            "UPDATE entities SET sync_status = 'pending' WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type, entity_id],
        )?;
        tx.commit()?;

        Ok(change.id)
    }

    /// Every active change, oldest first. Parked changes are excluded.
    pub fn peek_all(&self) -> Result<Vec<PendingChange>, StoreError> {
        select_changes(&self.conn, "state = 'active'")
    }

    /// Abandoned and rejected changes awaiting an operator decision.
    pub fn parked(&self) -> Result<Vec<PendingChange>, StoreError> {
        select_changes(&self.conn, "state != 'active'")
    }

    pub fn get_change(&self, id: Ulid) -> Result<Option<PendingChange>, StoreError> {
        load_change(&self.conn, id)
    }

    /// Number of active changes.
    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_changes WHERE state = 'active'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete a change regardless of state. Returns whether it existed.
    pub fn remove(&mut self, id: Ulid) -> Result<bool, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM pending_changes WHERE change_id = ?1",
            params![id.to_string()],
        )?;
        Ok(removed > 0)
    }

    /// Remote accepted the change: drop it and mark the entity synced once no
    /// other active change for it remains. One transaction.
    pub fn acknowledge(&mut self, id: Ulid) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let Some(change) = load_change(&tx, id)? else {
            return Ok(false);
        };

        tx.execute(
            "INSERT INTO acknowledged (entity_type, entity_id, created_at, seq)
             SELECT entity_type, entity_id, created_at, seq FROM pending_changes
             WHERE change_id = ?1
             ON CONFLICT (entity_type, entity_id) DO UPDATE
             SET created_at = excluded.created_at, seq = excluded.seq
             WHERE (excluded.created_at, excluded.seq) > (acknowledged.created_at, acknowledged.seq)",
            params![id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM pending_changes WHERE change_id = ?1",
            params![id.to_string()],
        )?;
        mark_synced_if_drained(&tx, &change.entity_type, &change.entity_id)?;
        tx.commit()?;

        Ok(true)
    }

    /// Record a transient failure. Increments the retry count and either
    /// schedules the next attempt or abandons the change once the bound is hit.
    pub fn requeue_with_backoff(
        &mut self,
        id: Ulid,
        error: &str,
    ) -> Result<RequeueOutcome, StoreError> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        let change = load_change(&tx, id)?.ok_or(StoreError::ChangeNotFound(id))?;
        if change.state != ChangeState::Active {
            return Err(StoreError::ChangeNotActive(id));
        }

        let retry_count = change.retry_count.saturating_add(1);
        let outcome = if self.policy.is_exhausted(retry_count) {
            tx.execute(
                "UPDATE pending_changes
                 SET retry_count = ?1, state = 'abandoned', next_attempt_at = NULL,
                     last_error = ?2, updated_at = ?3
                 WHERE change_id = ?4",
                params![retry_count, error, ts(now), id.to_string()],
            )?;
            RequeueOutcome::Abandoned { retry_count }
        } else {
            let next_attempt_at = chrono::Duration::from_std(self.policy.delay_for(retry_count))
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(now);
            tx.execute(
                "UPDATE pending_changes
                 SET retry_count = ?1, next_attempt_at = ?2, last_error = ?3, updated_at = ?4
                 WHERE change_id = ?5",
                params![retry_count, ts(next_attempt_at), error, ts(now), id.to_string()],
            )?;
            RequeueOutcome::Scheduled {
                retry_count,
                next_attempt_at,
            }
        };
        tx.commit()?;

        tracing::debug!("requeued change {}: {:?}", id, outcome);
        Ok(outcome)
    }

    /// Park a change the remote refused permanently.
    pub fn reject(&mut self, id: Ulid, reason: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        let change = load_change(&tx, id)?.ok_or(StoreError::ChangeNotFound(id))?;
        if change.state != ChangeState::Active {
            return Err(StoreError::ChangeNotActive(id));
        }

        tx.execute(
            "UPDATE pending_changes
             SET state = 'rejected', next_attempt_at = NULL, last_error = ?1, updated_at = ?2
             WHERE change_id = ?3",
            params![reason, ts(now), id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Discard a parked change. Active changes cannot be dismissed.
    pub fn dismiss(&mut self, id: Ulid) -> Result<bool, StoreError> {
        let Some(change) = self.get_change(id)? else {
            return Ok(false);
        };
        if change.state == ChangeState::Active {
            return Err(StoreError::ChangeStillActive(id));
        }
        self.remove(id)
    }

    /// Return a parked change to the active queue at its original position
    /// with a fresh retry budget. Refused with `ChangeSuperseded` once the
    /// remote has accepted a later change to the same entity.
    pub fn retry_parked(&mut self, id: Ulid) -> Result<(), StoreError> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        let change = load_change(&tx, id)?.ok_or(StoreError::ChangeNotFound(id))?;
        if change.state == ChangeState::Active {
            return Err(StoreError::ChangeStillActive(id));
        }

        let superseded: bool = tx.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM acknowledged a
                JOIN pending_changes p
                  ON a.entity_type = p.entity_type AND a.entity_id = p.entity_id
                WHERE p.change_id = ?1 AND (a.created_at, a.seq) > (p.created_at, p.seq)
             )",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        if superseded {
            return Err(StoreError::ChangeSuperseded(id));
        }

        tx.execute(
            "UPDATE pending_changes
             SET state = 'active', retry_count = 0, next_attempt_at = NULL,
                 last_error = NULL, updated_at = ?1
             WHERE change_id = ?2",
            params![ts(now), id.to_string()],
        )?;
        tx.execute(
            "UPDATE entities SET sync_status = 'pending' WHERE entity_type = ?1 AND entity_id = ?2",
            params![change.entity_type, change.entity_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use fieldsync_core::{
        Clock, Connectivity, Entity, MIGRANTS, ManualClock, RetryPolicy, Schema, SyncStatus,
    };
    use serde_json::json;
    use tempfile::TempDir;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: StdDuration::from_secs(2),
            max_delay: StdDuration::from_secs(60),
            request_timeout: StdDuration::from_secs(5),
        }
    }

    fn open_store(dir: &TempDir) -> (LocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = LocalStore::open(
            &dir.path().join("store.db"),
            Schema::migrant_health(),
            clock.clone(),
            policy(),
        )
        .unwrap();
        (store, clock)
    }

    fn offline_put(store: &mut LocalStore, id: &str) -> Ulid {
        store
            .put(MIGRANTS, Entity::new(id, json!({"id": id})), Connectivity::Offline)
            .unwrap()
            .change_id
            .unwrap()
    }

    #[test]
    fn peek_all_is_fifo_by_creation_time() {
        let dir = TempDir::new().unwrap();
        let (mut store, clock) = open_store(&dir);

        let a = offline_put(&mut store, "A");
        clock.advance(Duration::seconds(1));
        let b = offline_put(&mut store, "B");
        // Same timestamp falls back to insertion order
        let c = offline_put(&mut store, "C");

        let ids: Vec<_> = store.peek_all().unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn acknowledge_removes_change_and_marks_entity_synced() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open_store(&dir);

        let first = offline_put(&mut store, "A");
        let second = offline_put(&mut store, "A");

        assert!(store.acknowledge(first).unwrap());
        assert_eq!(
            store.get(MIGRANTS, "A").unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );

        assert!(store.acknowledge(second).unwrap());
        assert_eq!(
            store.get(MIGRANTS, "A").unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
        assert_eq!(store.count().unwrap(), 0);
        assert!(!store.acknowledge(second).unwrap());
    }

    #[test]
    fn requeue_schedules_with_exponential_backoff() {
        let dir = TempDir::new().unwrap();
        let (mut store, clock) = open_store(&dir);
        let id = offline_put(&mut store, "A");

        let outcome = store.requeue_with_backoff(id, "connection refused").unwrap();
        let expected_at = clock.now() + Duration::seconds(2);
        assert_eq!(
            outcome,
            RequeueOutcome::Scheduled {
                retry_count: 1,
                next_attempt_at: expected_at
            }
        );

        let change = store.get_change(id).unwrap().unwrap();
        assert_eq!(change.retry_count, 1);
        assert_eq!(change.last_error.as_deref(), Some("connection refused"));
        assert!(!change.is_due(clock.now()));
        assert!(change.is_due(expected_at));

        let outcome = store.requeue_with_backoff(id, "timeout").unwrap();
        assert!(matches!(
            outcome,
            RequeueOutcome::Scheduled { retry_count: 2, next_attempt_at } if next_attempt_at == clock.now() + Duration::seconds(4)
        ));
    }

    #[test]
    fn requeue_abandons_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open_store(&dir);
        let id = offline_put(&mut store, "A");

        store.requeue_with_backoff(id, "e1").unwrap();
        store.requeue_with_backoff(id, "e2").unwrap();
        let outcome = store.requeue_with_backoff(id, "e3").unwrap();

        assert_eq!(outcome, RequeueOutcome::Abandoned { retry_count: 3 });
        assert_eq!(store.count().unwrap(), 0);

        let parked = store.parked().unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].state, ChangeState::Abandoned);
        assert_eq!(parked[0].last_error.as_deref(), Some("e3"));

        // The entity keeps its pending status so the unsynced data stays visible
        assert_eq!(
            store.get(MIGRANTS, "A").unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );

        let err = store.requeue_with_backoff(id, "e4").unwrap_err();
        assert!(matches!(err, StoreError::ChangeNotActive(_)));
    }

    #[test]
    fn reject_parks_change() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open_store(&dir);
        let id = offline_put(&mut store, "A");

        store.reject(id, "422 invalid payload").unwrap();

        assert!(store.peek_all().unwrap().is_empty());
        let change = store.get_change(id).unwrap().unwrap();
        assert_eq!(change.state, ChangeState::Rejected);
        assert_eq!(change.last_error.as_deref(), Some("422 invalid payload"));
    }

    #[test]
    fn missing_change_operations() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open_store(&dir);
        let ghost = Ulid::new();

        assert!(matches!(
            store.requeue_with_backoff(ghost, "x").unwrap_err(),
            StoreError::ChangeNotFound(_)
        ));
        assert!(matches!(
            store.reject(ghost, "x").unwrap_err(),
            StoreError::ChangeNotFound(_)
        ));
        assert!(!store.remove(ghost).unwrap());
        assert!(!store.dismiss(ghost).unwrap());
    }

    #[test]
    fn dismiss_only_applies_to_parked_changes() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open_store(&dir);
        let id = offline_put(&mut store, "A");

        assert!(matches!(
            store.dismiss(id).unwrap_err(),
            StoreError::ChangeStillActive(_)
        ));

        store.reject(id, "no").unwrap();
        assert!(store.dismiss(id).unwrap());
        assert!(store.get_change(id).unwrap().is_none());
        assert!(store.parked().unwrap().is_empty());
    }

    #[test]
    fn retry_parked_keeps_original_queue_position() {
        let dir = TempDir::new().unwrap();
        let (mut store, clock) = open_store(&dir);
        let a = offline_put(&mut store, "A");
        store.reject(a, "no").unwrap();

        clock.advance(Duration::seconds(10));
        let b = offline_put(&mut store, "B");
        clock.advance(Duration::seconds(10));
        store.retry_parked(a).unwrap();

        let queued = store.peek_all().unwrap();
        let ids: Vec<_> = queued.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(queued[0].retry_count, 0);
        assert!(queued[0].last_error.is_none());
        assert!(matches!(
            store.retry_parked(a).unwrap_err(),
            StoreError::ChangeStillActive(_)
        ));
    }

    #[test]
    fn retried_change_stays_ahead_of_later_changes_to_its_entity() {
        let dir = TempDir::new().unwrap();
        let (mut store, clock) = open_store(&dir);
        let create = offline_put(&mut store, "M1");
        store.reject(create, "validation").unwrap();
        clock.advance(Duration::seconds(5));
        let update = offline_put(&mut store, "M1");

        store.retry_parked(create).unwrap();

        let ids: Vec<_> = store.peek_all().unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![create, update]);
    }

    #[test]
    fn retry_refused_once_a_later_change_was_accepted() {
        let dir = TempDir::new().unwrap();
        let (mut store, clock) = open_store(&dir);
        let create = offline_put(&mut store, "M1");
        clock.advance(Duration::seconds(5));
        let update = offline_put(&mut store, "M1");

        for _ in 0..3 {
            store.requeue_with_backoff(create, "503").unwrap();
        }
        assert!(store.acknowledge(update).unwrap());
        assert_eq!(
            store.get(MIGRANTS, "M1").unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );

        assert!(matches!(
            store.retry_parked(create).unwrap_err(),
            StoreError::ChangeSuperseded(id) if id == create
        ));
        // Still parked, and the entity keeps its synced status
        assert_eq!(store.parked().unwrap()[0].id, create);
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(
            store.get(MIGRANTS, "M1").unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );

        // A change to another entity is unaffected by that acknowledgment
        let other = offline_put(&mut store, "M2");
        store.reject(other, "no").unwrap();
        store.retry_parked(other).unwrap();
    }

    #[test]
    fn enqueue_marks_existing_entity_pending() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open_store(&dir);
        store
            .put(MIGRANTS, Entity::new("A", json!({})), Connectivity::Online)
            .unwrap();

        let id = store
            .enqueue(ChangeKind::Update, MIGRANTS, "A", json!({"id": "A"}))
            .unwrap();

        assert_eq!(store.get_change(id).unwrap().unwrap().kind, ChangeKind::Update);
        assert_eq!(
            store.get(MIGRANTS, "A").unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let (mut store, _) = open_store(&dir);
            offline_put(&mut store, "A")
        };

        let (store, _) = open_store(&dir);
        let queued = store.peek_all().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, id);
        assert_eq!(queued[0].kind, ChangeKind::Create);
    }
}
