// ABOUTME: Test utilities for fieldsync-sync, including a scripted in-memory remote service.
// ABOUTME: Records every call, keeps remote-side state, and injects failures per entity.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fieldsync_core::ChangeKind;
use ulid::Ulid;

use crate::remote::{RemoteError, RemoteRequest, RemoteService};

#[derive(Debug, Clone)]
enum Script {
    Always(RemoteError),
    Times(u32, RemoteError),
}

#[derive(Debug, Default)]
struct RemoteState {
    calls: Vec<RemoteRequest>,
    records: BTreeMap<(String, String), serde_json::Value>,
    applied: HashSet<Ulid>,
    scripts: HashMap<String, Script>,
}

/// An in-memory remote that accepts everything unless told otherwise.
///
/// Failures are scripted per entity id. Requests whose idempotency key was
/// already applied are acknowledged without touching the records again.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    state: Mutex<RemoteState>,
    latency: Duration,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every call for `entity_id` with `error`.
    pub fn fail_always(&self, entity_id: &str, error: RemoteError) {
        self.lock()
            .scripts
            .insert(entity_id.to_string(), Script::Always(error));
    }

    /// Fail the next `times` calls for `entity_id`, then accept.
    pub fn fail_times(&self, entity_id: &str, times: u32, error: RemoteError) {
        self.lock()
            .scripts
            .insert(entity_id.to_string(), Script::Times(times, error));
    }

    /// Permanently refuse every change to `entity_id`.
    pub fn reject(&self, entity_id: &str, reason: &str) {
        self.fail_always(entity_id, RemoteError::Rejected(reason.to_string()));
    }

    /// Accept calls for `entity_id` again.
    pub fn heal(&self, entity_id: &str) {
        self.lock().scripts.remove(entity_id);
    }

    /// Every request received, in arrival order.
    pub fn calls(&self) -> Vec<RemoteRequest> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// The remote copy of an entity, if it exists.
    pub fn record(&self, entity_type: &str, entity_id: &str) -> Option<serde_json::Value> {
        self.lock()
            .records
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned()
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RemoteService for ScriptedRemote {
    async fn apply(&self, request: &RemoteRequest) -> Result<(), RemoteError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.lock();
        state.calls.push(request.clone());

        let failure = match state.scripts.get_mut(&request.entity_id) {
            Some(Script::Always(error)) => Some(error.clone()),
            Some(Script::Times(remaining, error)) if *remaining > 0 => {
                *remaining -= 1;
                Some(error.clone())
            }
            _ => None,
        };
        if let Some(error) = failure {
            return Err(error);
        }

        if !state.applied.insert(request.idempotency_key) {
            return Ok(());
        }

        let key = (request.entity_type.clone(), request.entity_id.clone());
        match request.kind {
            ChangeKind::Create | ChangeKind::Update => {
                state.records.insert(key, request.payload.clone());
            }
            ChangeKind::Delete => {
                state.records.remove(&key);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
