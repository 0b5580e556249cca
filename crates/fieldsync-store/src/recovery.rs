// ABOUTME: Startup recovery for the local store and sync journal.
// ABOUTME: Repairs the journal, checks SQLite integrity, and rebuilds indexes when the schema changed.

use std::path::Path;
use std::sync::Arc;

use fieldsync_core::{Clock, RetryPolicy, Schema};
use thiserror::Error;

use crate::journal::{JournalError, SyncJournal};
use crate::sqlite::{LocalStore, StoreError};

const SCHEMA_FINGERPRINT: &str = "schema_fingerprint";

/// Errors that can occur during recovery.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("local store failed its integrity check: {0}")]
    Corrupt(String),
}

/// Open the store and journal under `dir`, healing what can be healed.
///
/// Recovery sequence:
/// 1. Repair the journal (drop a torn trailing line)
/// 2. Open the SQLite store and run its quick integrity check
/// 3. Compare the persisted schema fingerprint with the current schema
/// 4. On mismatch or first start, rebuild every index row from the entities
pub fn recover_store(
    dir: &Path,
    schema: Schema,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
) -> Result<(LocalStore, SyncJournal), RecoveryError> {
    std::fs::create_dir_all(dir)?;
    let store_path = dir.join("store.db");
    let journal_path = dir.join("journal.jsonl");

    if journal_path.exists() {
        let kept = SyncJournal::repair(&journal_path)?;
        tracing::info!("repaired sync journal: {} valid entries", kept);
    }
    let journal = SyncJournal::open(&journal_path)?;

    let mut store = LocalStore::open(&store_path, schema, clock, policy)?;
    if !store.integrity_check()? {
        return Err(RecoveryError::Corrupt(store_path.display().to_string()));
    }

    let expected = store.schema().fingerprint();
    match store.get_meta(SCHEMA_FINGERPRINT)? {
        Some(found) if found == expected => {
            tracing::info!("local indexes match the current schema");
        }
        Some(_) => {
            tracing::warn!("collection schema changed, rebuilding local indexes");
            let indexed = store.rebuild_indexes()?;
            tracing::info!("reindexed {} entities", indexed);
        }
        None => {
            tracing::info!("no schema fingerprint recorded, building local indexes");
            store.rebuild_indexes()?;
        }
    }

    let orphaned = store.orphaned_entity_count()?;
    if orphaned > 0 {
        tracing::warn!(
            "{} stored entities belong to collections the schema no longer declares",
            orphaned
        );
    }

    tracing::info!("recovered local store with {} pending changes", store.count()?);

    Ok((store, journal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::{CollectionDef, Connectivity, Entity, IndexDef, MIGRANTS, ManualClock};
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::default())
    }

    #[test]
    fn fresh_directory_recovers_empty() {
        let dir = TempDir::new().unwrap();
        let (store, journal) =
            recover_store(dir.path(), Schema::migrant_health(), clock(), RetryPolicy::default())
                .unwrap();

        assert_eq!(store.count().unwrap(), 0);
        assert!(journal.path().exists());
        assert_eq!(
            store.get_meta(SCHEMA_FINGERPRINT).unwrap(),
            Some(Schema::migrant_health().fingerprint())
        );
    }

    #[test]
    fn queue_and_entities_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let (mut store, _) =
                recover_store(dir.path(), Schema::migrant_health(), clock(), RetryPolicy::default())
                    .unwrap();
            store
                .put(
                    MIGRANTS,
                    Entity::new("M1", json!({"qr_code": "QR-1"})),
                    Connectivity::Offline,
                )
                .unwrap();
        }

        let (store, _) =
            recover_store(dir.path(), Schema::migrant_health(), clock(), RetryPolicy::default())
                .unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.find_unique(MIGRANTS, "qr_code", "QR-1").unwrap().is_some());
    }

    #[test]
    fn schema_change_rebuilds_indexes() {
        let dir = TempDir::new().unwrap();
        {
            let (mut store, _) =
                recover_store(dir.path(), Schema::migrant_health(), clock(), RetryPolicy::default())
                    .unwrap();
            store
                .put(
                    MIGRANTS,
                    Entity::new("M1", json!({"qr_code": "QR-1", "district": "Pune"})),
                    Connectivity::Online,
                )
                .unwrap();
        }

        let widened = Schema::migrant_health().with_collection(
            CollectionDef::new(MIGRANTS)
                .with_index(IndexDef::new("qr_code", "qr_code").unique())
                .with_index(IndexDef::new("district", "district")),
        );
        let (store, _) =
            recover_store(dir.path(), widened.clone(), clock(), RetryPolicy::default()).unwrap();

        let found = store.get_by_index(MIGRANTS, "district", "Pune").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            store.get_meta(SCHEMA_FINGERPRINT).unwrap(),
            Some(widened.fingerprint())
        );
    }

    #[test]
    fn torn_journal_line_is_repaired() {
        let dir = TempDir::new().unwrap();
        let journal_path = dir.path().join("journal.jsonl");
        std::fs::write(&journal_path, "").unwrap();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&journal_path)
            .unwrap();
        write!(file, "{{\"change_id\":").unwrap();
        drop(file);

        recover_store(dir.path(), Schema::migrant_health(), clock(), RetryPolicy::default())
            .unwrap();

        assert!(SyncJournal::replay(&journal_path).unwrap().is_empty());
    }
}
