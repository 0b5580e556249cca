// ABOUTME: Sync engine that drains the change queue against the remote service.
// ABOUTME: Runs at most one pass at a time, preserves per-entity order, and applies retry, abandon, and reject rules.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fieldsync_core::{Clock, Connectivity, PendingChange, RetryPolicy, SyncEvent, SyncSummary};
use fieldsync_store::{JournalEntry, JournalOutcome, RequeueOutcome, StoreError, StoreHandle};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::remote::{RemoteError, RemoteRequest, RemoteService};

/// Errors that abort a sync pass. Remote failures never do; they are
/// recorded against the change instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Whether the queue is settled, which drives follow-up passes. This is not
/// the user-facing verdict: a pass that only abandons or rejects changes
/// leaves nothing to retry, so it ends `Succeeded` while its `SyncFinished`
/// event reports `SyncResult::Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    /// Last pass settled every change it saw: accepted, abandoned, or rejected.
    Succeeded,
    /// Last pass left changes queued or hit a store error.
    Failed,
}

/// What a call to `sync` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncSummary),
    /// Another pass was already running; this call did nothing.
    AlreadyRunning,
    Offline,
    ShuttingDown,
}

struct Inner {
    store: StoreHandle,
    remote: Arc<dyn RemoteService>,
    connectivity: watch::Receiver<Connectivity>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SyncEvent>,
    state: watch::Sender<SyncState>,
    shutdown: AtomicBool,
}

/// Cloneable handle to the sync engine. All clones share one re-entrancy guard.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

/// Puts the engine back to `Failed` if a pass ends without reporting, e.g.
/// when the sync future is dropped mid-pass.
struct PassGuard<'a> {
    state: &'a watch::Sender<SyncState>,
    finished: bool,
}

impl PassGuard<'_> {
    fn finish(mut self, state: SyncState) {
        self.state.send_replace(state);
        self.finished = true;
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state.send_replace(SyncState::Failed);
        }
    }
}

impl SyncEngine {
    pub fn new(
        store: StoreHandle,
        remote: Arc<dyn RemoteService>,
        connectivity: watch::Receiver<Connectivity>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                connectivity,
                policy,
                clock,
                events,
                state,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    /// Stop picking up new changes. A call already in flight finishes or times out.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_online(&self) -> bool {
        self.inner.connectivity.borrow().is_online()
    }

    fn stopping(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Run one pass over the queue unless one is already running.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        if self.stopping() {
            return Ok(SyncOutcome::ShuttingDown);
        }
        if !self.is_online() {
            tracing::debug!("sync requested while offline, skipping");
            return Ok(SyncOutcome::Offline);
        }

        let acquired = self.inner.state.send_if_modified(|state| {
            if *state == SyncState::Syncing {
                false
            } else {
                *state = SyncState::Syncing;
                true
            }
        });
        if !acquired {
            tracing::debug!("sync already running");
            return Ok(SyncOutcome::AlreadyRunning);
        }

        let guard = PassGuard {
            state: &self.inner.state,
            finished: false,
        };

        match self.run_pass().await {
            Ok(summary) => {
                guard.finish(if summary.is_complete() {
                    SyncState::Succeeded
                } else {
                    SyncState::Failed
                });
                Ok(SyncOutcome::Completed(summary))
            }
            Err(e) => {
                tracing::error!("sync pass aborted: {}", e);
                guard.finish(SyncState::Failed);
                Err(e)
            }
        }
    }

    async fn run_pass(&self) -> Result<SyncSummary, SyncError> {
        let inner = &self.inner;
        let snapshot = inner.store.peek_all().await?;
        let mut summary = SyncSummary {
            queued: snapshot.len(),
            ..SyncSummary::default()
        };

        tracing::info!(
            "sync pass starting against {} with {} queued changes",
            inner.remote.name(),
            snapshot.len()
        );
        let _ = inner.events.send(SyncEvent::SyncStarted {
            queued: snapshot.len(),
        });

        // Entities with an earlier change still queued in this pass
        let mut blocked: HashSet<(&str, &str)> = HashSet::new();

        for (position, change) in snapshot.iter().enumerate() {
            if !self.is_online() || self.stopping() {
                summary.remaining = snapshot.len() - position;
                tracing::info!(
                    "sync pass stopping early, {} changes left queued",
                    summary.remaining
                );
                break;
            }

            let target = change.target();
            if blocked.contains(&target) {
                summary.blocked += 1;
                continue;
            }
            if !change.is_due(inner.clock.now()) {
                summary.deferred += 1;
                blocked.insert(target);
                continue;
            }

            summary.attempted += 1;
            match self.attempt(change).await {
                Ok(()) => {
                    inner.store.acknowledge(change.id).await?;
                    summary.accepted += 1;
                    tracing::debug!("change {} accepted", change.id);
                    self.journal(change, JournalOutcome::Accepted).await;
                }
                Err(err) if err.is_permanent() => {
                    let reason = err.to_string();
                    inner.store.reject(change.id, &reason).await?;
                    summary.rejected += 1;
                    tracing::warn!(
                        "change {} to {}/{} rejected: {}",
                        change.id,
                        change.entity_type,
                        change.entity_id,
                        reason
                    );
                    let _ = inner.events.send(SyncEvent::ChangeRejected {
                        change_id: change.id,
                        entity_type: change.entity_type.clone(),
                        entity_id: change.entity_id.clone(),
                        kind: change.kind,
                        reason: reason.clone(),
                    });
                    self.journal(change, JournalOutcome::Rejected { reason })
                        .await;
                }
                Err(err) => {
                    let error = err.to_string();
                    match inner.store.requeue_with_backoff(change.id, &error).await? {
                        RequeueOutcome::Scheduled {
                            retry_count,
                            next_attempt_at,
                        } => {
                            summary.retried += 1;
                            blocked.insert(target);
                            tracing::warn!(
                                "change {} failed (attempt {}): {}; next attempt at {}",
                                change.id,
                                retry_count,
                                error,
                                next_attempt_at
                            );
                            self.journal(
                                change,
                                JournalOutcome::RetryScheduled {
                                    retry_count,
                                    next_attempt_at,
                                },
                            )
                            .await;
                        }
                        RequeueOutcome::Abandoned { retry_count } => {
                            summary.abandoned += 1;
                            tracing::error!(
                                "change {} to {}/{} abandoned after {} attempts: {}",
                                change.id,
                                change.entity_type,
                                change.entity_id,
                                retry_count,
                                error
                            );
                            let _ = inner.events.send(SyncEvent::ChangeAbandoned {
                                change_id: change.id,
                                entity_type: change.entity_type.clone(),
                                entity_id: change.entity_id.clone(),
                                kind: change.kind,
                                retry_count,
                                error: error.clone(),
                            });
                            self.journal(change, JournalOutcome::Abandoned { retry_count, error })
                                .await;
                        }
                    }
                }
            }
        }

        let count = inner.store.count().await?;
        let result = summary.result();
        tracing::info!(
            "sync pass finished ({:?}): {} accepted, {} retried, {} abandoned, {} rejected, {} still queued",
            result,
            summary.accepted,
            summary.retried,
            summary.abandoned,
            summary.rejected,
            count
        );
        let _ = inner.events.send(SyncEvent::PendingCountChanged { count });
        let _ = inner.events.send(SyncEvent::SyncFinished { result, summary });

        Ok(summary)
    }

    async fn attempt(&self, change: &PendingChange) -> Result<(), RemoteError> {
        let request = RemoteRequest::from(change);
        let timeout = self.inner.policy.request_timeout;
        match tokio::time::timeout(timeout, self.inner.remote.apply(&request)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(timeout)),
        }
    }

    async fn journal(&self, change: &PendingChange, outcome: JournalOutcome) {
        let entry = JournalEntry::for_change(change, self.inner.clock.now(), outcome);
        if let Err(e) = self.inner.store.record(entry).await {
            tracing::warn!("failed to journal outcome of change {}: {}", change.id, e);
        }
    }
}
