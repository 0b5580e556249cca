// ABOUTME: Async handle to the local store, which runs on its own dedicated thread.
// ABOUTME: Serializes every store and journal operation through one channel so writes never interleave.

use std::thread;

use fieldsync_core::{ChangeKind, Connectivity, Entity, PendingChange};
use tokio::sync::{mpsc, oneshot};
use ulid::Ulid;

use crate::journal::{JournalEntry, SyncJournal};
use crate::queue::RequeueOutcome;
use crate::sqlite::{DeleteReceipt, EntityFilter, LocalStore, StoreError, WriteReceipt};

type Job = Box<dyn FnOnce(&mut LocalStore, &mut SyncJournal) + Send>;

/// Cloneable async front for the store thread. Dropping every clone stops the thread.
#[derive(Clone)]
pub struct StoreHandle {
    jobs: mpsc::Sender<Job>,
}

/// Move the store and journal onto a dedicated thread and return a handle to it.
pub fn spawn(mut store: LocalStore, mut journal: SyncJournal) -> Result<StoreHandle, StoreError> {
    let (jobs, mut rx) = mpsc::channel::<Job>(64);

    thread::Builder::new()
        .name("fieldsync-store".to_string())
        .spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                job(&mut store, &mut journal);
            }
            tracing::debug!("store thread exiting");
        })?;

    Ok(StoreHandle { jobs })
}

impl StoreHandle {
    /// Run a closure against the store on its thread and await the result.
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut LocalStore, &mut SyncJournal) -> Result<T, StoreError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |store, journal| {
            // The caller may have stopped waiting
            let _ = tx.send(f(store, journal));
        });
        self.jobs
            .send(job)
            .await
            .map_err(|_| StoreError::ActorClosed)?;
        rx.await.map_err(|_| StoreError::ActorClosed)?
    }

    pub async fn put(
        &self,
        entity_type: &str,
        entity: Entity,
        connectivity: Connectivity,
    ) -> Result<WriteReceipt, StoreError> {
        let entity_type = entity_type.to_string();
        self.call(move |store, _| store.put(&entity_type, entity, connectivity))
            .await
    }

    pub async fn delete(
        &self,
        entity_type: &str,
        id: &str,
        connectivity: Connectivity,
    ) -> Result<DeleteReceipt, StoreError> {
        let (entity_type, id) = (entity_type.to_string(), id.to_string());
        self.call(move |store, _| store.delete(&entity_type, &id, connectivity))
            .await
    }

    pub async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, StoreError> {
        let (entity_type, id) = (entity_type.to_string(), id.to_string());
        self.call(move |store, _| store.get(&entity_type, &id)).await
    }

    pub async fn list(
        &self,
        entity_type: &str,
        filter: EntityFilter,
    ) -> Result<Vec<Entity>, StoreError> {
        let entity_type = entity_type.to_string();
        self.call(move |store, _| store.list(&entity_type, &filter))
            .await
    }

    pub async fn get_by_index(
        &self,
        entity_type: &str,
        index_name: &str,
        key: &str,
    ) -> Result<Vec<Entity>, StoreError> {
        let (entity_type, index_name, key) =
            (entity_type.to_string(), index_name.to_string(), key.to_string());
        self.call(move |store, _| store.get_by_index(&entity_type, &index_name, &key))
            .await
    }

    pub async fn find_unique(
        &self,
        entity_type: &str,
        index_name: &str,
        key: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let (entity_type, index_name, key) =
            (entity_type.to_string(), index_name.to_string(), key.to_string());
        self.call(move |store, _| store.find_unique(&entity_type, &index_name, &key))
            .await
    }

    pub async fn mark_synced(&self, entity_type: &str, id: &str) -> Result<bool, StoreError> {
        let (entity_type, id) = (entity_type.to_string(), id.to_string());
        self.call(move |store, _| store.mark_synced(&entity_type, &id))
            .await
    }

    pub async fn enqueue(
        &self,
        kind: ChangeKind,
        entity_type: &str,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<Ulid, StoreError> {
        let (entity_type, entity_id) = (entity_type.to_string(), entity_id.to_string());
        self.call(move |store, _| store.enqueue(kind, &entity_type, &entity_id, payload))
            .await
    }

    pub async fn peek_all(&self) -> Result<Vec<PendingChange>, StoreError> {
        self.call(|store, _| store.peek_all()).await
    }

    pub async fn parked(&self) -> Result<Vec<PendingChange>, StoreError> {
        self.call(|store, _| store.parked()).await
    }

    pub async fn get_change(&self, id: Ulid) -> Result<Option<PendingChange>, StoreError> {
        self.call(move |store, _| store.get_change(id)).await
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.call(|store, _| store.count()).await
    }

    pub async fn remove(&self, id: Ulid) -> Result<bool, StoreError> {
        self.call(move |store, _| store.remove(id)).await
    }

    pub async fn acknowledge(&self, id: Ulid) -> Result<bool, StoreError> {
        self.call(move |store, _| store.acknowledge(id)).await
    }

    pub async fn requeue_with_backoff(
        &self,
        id: Ulid,
        error: &str,
    ) -> Result<RequeueOutcome, StoreError> {
        let error = error.to_string();
        self.call(move |store, _| store.requeue_with_backoff(id, &error))
            .await
    }

    pub async fn reject(&self, id: Ulid, reason: &str) -> Result<(), StoreError> {
        let reason = reason.to_string();
        self.call(move |store, _| store.reject(id, &reason)).await
    }

    pub async fn dismiss(&self, id: Ulid) -> Result<bool, StoreError> {
        self.call(move |store, _| store.dismiss(id)).await
    }

    pub async fn retry_parked(&self, id: Ulid) -> Result<(), StoreError> {
        self.call(move |store, _| store.retry_parked(id)).await
    }

    /// Append one outcome line to the sync journal.
    pub async fn record(&self, entry: JournalEntry) -> Result<(), StoreError> {
        self.call(move |_, journal| Ok(journal.append(&entry)?))
            .await
    }

    /// Every journal entry written so far, oldest first.
    pub async fn journal_entries(&self) -> Result<Vec<JournalEntry>, StoreError> {
        self.call(|_, journal| Ok(SyncJournal::replay(journal.path())?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use fieldsync_core::{MIGRANTS, ManualClock, RetryPolicy, Schema, SyncStatus};
    use serde_json::json;
    use tempfile::TempDir;

    use crate::journal::JournalOutcome;

    fn spawn_store(dir: &TempDir) -> StoreHandle {
        let store = LocalStore::open(
            &dir.path().join("store.db"),
            Schema::migrant_health(),
            Arc::new(ManualClock::default()),
            RetryPolicy::default(),
        )
        .unwrap();
        let journal = SyncJournal::open(&dir.path().join("journal.jsonl")).unwrap();
        spawn(store, journal).unwrap()
    }

    #[tokio::test]
    async fn handle_round_trips_store_operations() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_store(&dir);

        let receipt = handle
            .put(MIGRANTS, Entity::new("M1", json!({"qr_code": "QR-1"})), Connectivity::Offline)
            .await
            .unwrap();
        let change_id = receipt.change_id.unwrap();

        assert_eq!(handle.count().await.unwrap(), 1);
        assert_eq!(
            handle.find_unique(MIGRANTS, "qr_code", "QR-1").await.unwrap().unwrap().id,
            "M1"
        );

        assert!(handle.acknowledge(change_id).await.unwrap());
        let stored = handle.get(MIGRANTS, "M1").await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn concurrent_writers_are_serialized() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_store(&dir);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .put(
                        MIGRANTS,
                        Entity::new(format!("M{i}"), json!({"n": i})),
                        Connectivity::Offline,
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(handle.count().await.unwrap(), 20);
        assert_eq!(
            handle.list(MIGRANTS, EntityFilter::all()).await.unwrap().len(),
            20
        );
    }

    #[tokio::test]
    async fn journal_records_are_readable() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_store(&dir);

        let change = PendingChange::new(ChangeKind::Delete, MIGRANTS, "M1", json!({}), Utc::now());
        handle
            .record(JournalEntry::for_change(&change, Utc::now(), JournalOutcome::Accepted))
            .await
            .unwrap();

        let entries = handle.journal_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].change_id, change.id);
    }

    #[tokio::test]
    async fn errors_propagate_through_the_handle() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_store(&dir);

        let err = handle.get("nope", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownCollection(_)));
    }
}
