// ABOUTME: Persistence layer for fieldsync: the local entity store, change queue, and sync journal.
// ABOUTME: Provides SQLite storage, JSONL journal, crash recovery, and an async handle to the store thread.

pub mod handle;
pub mod journal;
pub mod manager;
pub mod queue;
pub mod recovery;
pub mod sqlite;

pub use handle::StoreHandle;
pub use journal::{JournalEntry, JournalError, JournalOutcome, SyncJournal};
pub use manager::{ManagerError, StorageManager};
pub use queue::RequeueOutcome;
pub use recovery::{RecoveryError, recover_store};
pub use sqlite::{DeleteReceipt, EntityFilter, LocalStore, StoreError, WriteReceipt};
