// ABOUTME: Storage manager for the fieldsync home directory layout.
// ABOUTME: Creates the directory, runs recovery, and starts the store thread.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fieldsync_core::{Clock, RetryPolicy, Schema};
use thiserror::Error;

use crate::handle::{self, StoreHandle};
use crate::recovery::{RecoveryError, recover_store};
use crate::sqlite::StoreError;

/// Errors that can occur during storage management operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Owns the fieldsync home directory: `store.db` and `journal.jsonl`.
pub struct StorageManager {
    home: PathBuf,
}

impl StorageManager {
    /// Create a manager rooted at `home`, creating the directory if needed.
    pub fn new(home: PathBuf) -> Result<Self, ManagerError> {
        fs::create_dir_all(&home)?;
        Ok(Self { home })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn store_path(&self) -> PathBuf {
        self.home.join("store.db")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.home.join("journal.jsonl")
    }

    /// Recover the store and journal, then hand them to the store thread.
    pub fn open(
        &self,
        schema: Schema,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Result<StoreHandle, ManagerError> {
        let (store, journal) = recover_store(&self.home, schema, clock, policy)?;
        tracing::info!("local store opened at {}", self.home.display());
        Ok(handle::spawn(store, journal)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::{Connectivity, Entity, MIGRANTS, SystemClock};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn new_creates_home_directory() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("fieldsync");
        let manager = StorageManager::new(home.clone()).unwrap();

        assert!(home.is_dir());
        assert_eq!(manager.store_path(), home.join("store.db"));
        assert_eq!(manager.journal_path(), home.join("journal.jsonl"));
    }

    #[tokio::test]
    async fn open_recovers_previous_session() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::new(dir.path().to_path_buf()).unwrap();

        {
            let handle = manager
                .open(Schema::migrant_health(), Arc::new(SystemClock), RetryPolicy::default())
                .unwrap();
            handle
                .put(MIGRANTS, Entity::new("M1", json!({})), Connectivity::Offline)
                .await
                .unwrap();
        }

        let handle = manager
            .open(Schema::migrant_health(), Arc::new(SystemClock), RetryPolicy::default())
            .unwrap();
        assert_eq!(handle.count().await.unwrap(), 1);
        assert!(manager.store_path().exists());
    }
}
