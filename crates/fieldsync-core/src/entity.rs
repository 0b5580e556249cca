// ABOUTME: Defines the Entity struct, a locally persisted domain record with sync metadata.
// ABOUTME: Entities carry an arbitrary JSON payload plus last-modified time and sync status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::ParseEnumError;

/// Whether the latest local state of an entity has been confirmed by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            other => Err(ParseEnumError::new("sync status", other)),
        }
    }
}

/// A domain record (migrant, health encounter, consent) as held by the local store.
/// `last_modified` and `sync_status` are owned by the store and overwritten on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub payload: serde_json::Value,
    pub last_modified: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

impl Entity {
    /// Create an entity ready to be written. The store stamps the real
    /// modification time and sync status when it is persisted.
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
            last_modified: Utc::now(),
            sync_status: SyncStatus::Pending,
        }
    }

    /// Build an entity from a payload that carries its own string `id` field.
    pub fn from_payload(payload: serde_json::Value) -> Option<Self> {
        let id = payload.get("id")?.as_str()?.to_string();
        Some(Self::new(id, payload))
    }

    /// Resolve a dotted field path (e.g. `address.city`) inside the payload.
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        path.split('.')
            .try_fold(&self.payload, |value, segment| value.get(segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_payload_reads_id_field() {
        let entity = Entity::from_payload(json!({"id": "M1", "name": "Asha"})).unwrap();
        assert_eq!(entity.id, "M1");
        assert_eq!(entity.payload["name"], "Asha");
    }

    #[test]
    fn from_payload_requires_string_id() {
        assert!(Entity::from_payload(json!({"name": "no id"})).is_none());
        assert!(Entity::from_payload(json!({"id": 42})).is_none());
    }

    #[test]
    fn field_resolves_nested_paths() {
        let entity = Entity::new("M1", json!({"address": {"city": "Kochi"}}));
        assert_eq!(entity.field("address.city"), Some(&json!("Kochi")));
        assert_eq!(entity.field("address.zip"), None);
    }

    #[test]
    fn sync_status_parses_its_own_rendering() {
        for status in [SyncStatus::Synced, SyncStatus::Pending] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("stale".parse::<SyncStatus>().is_err());
    }
}
