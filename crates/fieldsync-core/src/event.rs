// ABOUTME: UI-facing notifications published by the offline service and sync engine.
// ABOUTME: Also defines the per-pass SyncSummary and its success/partial/failure classification.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::change::ChangeKind;

/// Aggregate outcome of one sync pass as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResult {
    Success,
    Partial,
    Failure,
}

/// Per-pass counters. `queued` is the size of the snapshot taken at pass start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub queued: usize,
    pub attempted: usize,
    pub accepted: usize,
    /// Failed transiently and scheduled for another attempt.
    pub retried: usize,
    pub abandoned: usize,
    pub rejected: usize,
    /// Not attempted because an earlier change to the same entity is still queued.
    pub blocked: usize,
    /// Not attempted because the backoff gate has not opened yet.
    pub deferred: usize,
    /// Not attempted because the pass stopped (offline or shutdown).
    pub remaining: usize,
}

impl SyncSummary {
    /// Every snapshotted change was removed, abandoned, or rejected.
    pub fn is_complete(&self) -> bool {
        self.retried + self.blocked + self.deferred + self.remaining == 0
    }

    pub fn result(&self) -> SyncResult {
        if self.is_complete() && self.abandoned + self.rejected == 0 {
            SyncResult::Success
        } else if self.accepted > 0 {
            SyncResult::Partial
        } else {
            SyncResult::Failure
        }
    }
}

/// Notifications consumed by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    PendingCountChanged {
        count: usize,
    },
    SyncStarted {
        queued: usize,
    },
    SyncFinished {
        result: SyncResult,
        summary: SyncSummary,
    },
    ChangeRejected {
        change_id: Ulid,
        entity_type: String,
        entity_id: String,
        kind: ChangeKind,
        reason: String,
    },
    ChangeAbandoned {
        change_id: Ulid,
        entity_type: String,
        entity_id: String,
        kind: ChangeKind,
        retry_count: u32,
        error: String,
    },
    ConnectivityRestored,
    WentOffline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pass_is_a_success() {
        assert_eq!(SyncSummary::default().result(), SyncResult::Success);
    }

    #[test]
    fn all_accepted_is_a_success() {
        let summary = SyncSummary {
            queued: 3,
            attempted: 3,
            accepted: 3,
            ..SyncSummary::default()
        };
        assert!(summary.is_complete());
        assert_eq!(summary.result(), SyncResult::Success);
    }

    #[test]
    fn abandoned_items_complete_the_pass_but_are_partial() {
        let summary = SyncSummary {
            queued: 3,
            attempted: 3,
            accepted: 2,
            abandoned: 1,
            ..SyncSummary::default()
        };
        assert!(summary.is_complete());
        assert_eq!(summary.result(), SyncResult::Partial);
    }

    #[test]
    fn nothing_accepted_with_retries_is_a_failure() {
        let summary = SyncSummary {
            queued: 2,
            attempted: 1,
            retried: 1,
            blocked: 1,
            ..SyncSummary::default()
        };
        assert!(!summary.is_complete());
        assert_eq!(summary.result(), SyncResult::Failure);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(SyncEvent::PendingCountChanged { count: 4 }).unwrap();
        assert_eq!(json["type"], "PendingCountChanged");
        assert_eq!(json["count"], 4);
    }
}
