// ABOUTME: Defines PendingChange, a queued local mutation awaiting remote acknowledgment.
// ABOUTME: Carries the change kind, target entity, replay payload, and retry bookkeeping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Error returned when a stored enum discriminant cannot be parsed.
#[derive(Debug, Error)]
#[error("unknown {what}: {value}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// The mutation a pending change replays against the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeKind::Create),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(ParseEnumError::new("change kind", other)),
        }
    }
}

/// Lifecycle state of a queued change. Only `Active` changes take part in
/// automatic sync; the other two are parked until an operator acts on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Active,
    /// Exceeded the retry bound after transient failures.
    Abandoned,
    /// Permanently refused by the remote service.
    Rejected,
}

impl ChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeState::Active => "active",
            ChangeState::Abandoned => "abandoned",
            ChangeState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ChangeState::Active),
            "abandoned" => Ok(ChangeState::Abandoned),
            "rejected" => Ok(ChangeState::Rejected),
            other => Err(ParseEnumError::new("change state", other)),
        }
    }
}

/// A not-yet-confirmed mutation. Created in the same transaction as the
/// local write that caused it and replayed in `created_at` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: Ulid,
    pub kind: ChangeKind,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub state: ChangeState,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PendingChange {
    /// Create a fresh active change with a new ULID and no retry history.
    pub fn new(
        kind: ChangeKind,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            kind,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            created_at,
            retry_count: 0,
            state: ChangeState::Active,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Whether the backoff gate allows another attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == ChangeState::Active && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Collection and entity id this change targets.
    pub fn target(&self) -> (&str, &str) {
        (&self.entity_type, &self.entity_id)
    }
}
