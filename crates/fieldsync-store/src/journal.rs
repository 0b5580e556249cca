// ABOUTME: Append-only JSONL journal recording the outcome of every sync attempt.
// ABOUTME: Provides crash-safe append, sequential replay, and repair for truncated files.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fieldsync_core::{ChangeKind, PendingChange};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How one attempt at a pending change ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JournalOutcome {
    Accepted,
    RetryScheduled {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Abandoned {
        retry_count: u32,
        error: String,
    },
    Rejected {
        reason: String,
    },
}

/// One line of the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub change_id: Ulid,
    pub entity_type: String,
    pub entity_id: String,
    pub kind: ChangeKind,
    #[serde(flatten)]
    pub outcome: JournalOutcome,
}

impl JournalEntry {
    pub fn for_change(change: &PendingChange, at: DateTime<Utc>, outcome: JournalOutcome) -> Self {
        Self {
            at,
            change_id: change.id,
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id.clone(),
            kind: change.kind,
            outcome,
        }
    }
}

/// The sync journal file. Each line is one JSON-serialized JournalEntry.
pub struct SyncJournal {
    path: PathBuf,
    file: File,
}

impl SyncJournal {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open (or create) the journal, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Append one entry and fsync.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        let json = serde_json::to_string(entry)?;
        writeln!(self.file, "{}", json)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Read every entry in order. Empty lines are skipped.
    pub fn replay(path: &Path) -> Result<Vec<JournalEntry>, JournalError> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }

        Ok(entries)
    }

    /// Drop unparseable lines (a torn final write after a crash) by rewriting
    /// the file through a temp file and an atomic rename. Returns the count kept.
    pub fn repair(path: &Path) -> Result<usize, JournalError> {
        let reader = BufReader::new(File::open(path)?);
        let mut valid_lines: Vec<String> = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if serde_json::from_str::<JournalEntry>(&line).is_ok() {
                valid_lines.push(line);
            }
        }

        let tmp_path = path.with_extension("jsonl.tmp");
        let mut tmp_file = File::create(&tmp_path)?;
        for line in &valid_lines {
            writeln!(tmp_file, "{}", line)?;
        }
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }

        Ok(valid_lines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(outcome: JournalOutcome) -> JournalEntry {
        let change = PendingChange::new(
            ChangeKind::Create,
            "migrants",
            "M1",
            json!({"id": "M1"}),
            Utc::now(),
        );
        JournalEntry::for_change(&change, Utc::now(), outcome)
    }

    #[test]
    fn append_and_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");

        let mut journal = SyncJournal::open(&path).unwrap();
        let first = entry(JournalOutcome::Rejected {
            reason: "bad".into(),
        });
        let second = entry(JournalOutcome::Accepted);
        journal.append(&first).unwrap();
        journal.append(&second).unwrap();

        let replayed = SyncJournal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first, second]);
    }

    #[test]
    fn outcome_is_flattened_into_the_line() {
        let line = serde_json::to_value(entry(JournalOutcome::Abandoned {
            retry_count: 3,
            error: "timeout".into(),
        }))
        .unwrap();
        assert_eq!(line["outcome"], "abandoned");
        assert_eq!(line["retry_count"], 3);
        assert_eq!(line["kind"], "create");
    }

    #[test]
    fn repair_drops_torn_trailing_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");

        let mut journal = SyncJournal::open(&path).unwrap();
        journal.append(&entry(JournalOutcome::Accepted)).unwrap();
        drop(journal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"at\":\"2026-").unwrap();
        drop(file);

        assert!(SyncJournal::replay(&path).is_err());
        assert_eq!(SyncJournal::repair(&path).unwrap(), 1);
        assert_eq!(SyncJournal::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("journal.jsonl");
        let journal = SyncJournal::open(&path).unwrap();
        assert_eq!(journal.path(), path.as_path());
        assert!(SyncJournal::replay(&path).unwrap().is_empty());
    }
}
