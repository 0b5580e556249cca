// ABOUTME: Remote record service abstraction the sync engine replays pending changes against.
// ABOUTME: Classifies failures as transient (retry with backoff) or permanent (park as rejected).

use std::time::Duration;

use async_trait::async_trait;
use fieldsync_core::{ChangeKind, PendingChange};
use thiserror::Error;
use ulid::Ulid;

/// One mutation sent to the remote. The change id doubles as the idempotency
/// key, so a retried request that already landed is not applied twice.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub idempotency_key: Ulid,
    pub kind: ChangeKind,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
}

impl From<&PendingChange> for RemoteRequest {
    fn from(change: &PendingChange) -> Self {
        Self {
            idempotency_key: change.id,
            kind: change.kind,
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id.clone(),
            payload: change.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure or a server-side error worth retrying.
    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The remote refused the change; retrying cannot help.
    #[error("remote rejected change: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, RemoteError::Rejected(_))
    }
}

/// The remote record service. Implementations must be safe to call with the
/// same idempotency key more than once.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn apply(&self, request: &RemoteRequest) -> Result<(), RemoteError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn request_carries_change_identity() {
        let change = PendingChange::new(
            ChangeKind::Update,
            "migrants",
            "M1",
            json!({"name": "Asha"}),
            Utc::now(),
        );
        let request = RemoteRequest::from(&change);

        assert_eq!(request.idempotency_key, change.id);
        assert_eq!(request.kind, ChangeKind::Update);
        assert_eq!(request.entity_id, "M1");
        assert_eq!(request.payload["name"], "Asha");
    }

    #[test]
    fn only_rejections_are_permanent() {
        assert!(RemoteError::Rejected("422".into()).is_permanent());
        assert!(!RemoteError::Transient("503".into()).is_permanent());
        assert!(!RemoteError::Timeout(Duration::from_secs(1)).is_permanent());
    }
}
