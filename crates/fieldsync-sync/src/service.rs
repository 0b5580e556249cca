// ABOUTME: OfflineService facade wiring the store handle, connectivity monitor, and sync engine together.
// ABOUTME: Offers entity reads and writes, queue inspection, operator actions, and migrant/health-record helpers.

use std::sync::Arc;

use fieldsync_core::{
    CONSENT_RECORDS, Clock, Connectivity, Entity, HEALTH_RECORDS, MIGRANTS, PendingChange,
    RetryPolicy, SyncEvent, SystemClock,
};
use fieldsync_store::{
    DeleteReceipt, EntityFilter, JournalEntry, StoreError, StoreHandle, WriteReceipt,
};
use futures::stream::{self, Stream};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::connectivity::{ConnectivityMonitor, Transition};
use crate::engine::{SyncEngine, SyncError, SyncOutcome, SyncState};
use crate::remote::RemoteService;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("no remote service configured")]
    MissingRemote,

    #[error("entity payload has no string \"id\" field")]
    MissingId,

    #[error("reachability is driven by an external signal")]
    ExternalSignal,
}

/// Builder for OfflineService. Only the store handle and remote are required.
pub struct OfflineServiceBuilder {
    store: StoreHandle,
    remote: Option<Arc<dyn RemoteService>>,
    signal: Option<watch::Receiver<bool>>,
    start_online: bool,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    sync_on_start: bool,
}

impl OfflineServiceBuilder {
    pub fn remote(mut self, remote: Arc<dyn RemoteService>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Drive connectivity from an external reachability signal.
    pub fn reachability(mut self, signal: watch::Receiver<bool>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Initial connectivity when no external signal is supplied.
    pub fn start_online(mut self, online: bool) -> Self {
        self.start_online = online;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run one sync pass right after startup when already online.
    pub fn sync_on_start(mut self, enabled: bool) -> Self {
        self.sync_on_start = enabled;
        self
    }

    /// Assemble the service. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<OfflineService, ServiceError> {
        let remote = self.remote.ok_or(ServiceError::MissingRemote)?;

        let (signal, local_signal) = match self.signal {
            Some(signal) => (signal, None),
            None => {
                let (tx, rx) = watch::channel(self.start_online);
                (rx, Some(tx))
            }
        };

        let monitor = Arc::new(ConnectivityMonitor::new(Connectivity::from(*signal.borrow())));
        let (events, _) = broadcast::channel(256);
        let engine = SyncEngine::new(
            self.store.clone(),
            remote,
            monitor.watcher(),
            self.policy,
            self.clock.clone(),
            events.clone(),
        );

        let monitor_task = {
            let monitor = monitor.clone();
            let engine = engine.clone();
            let events = events.clone();
            tokio::spawn(async move { monitor.run(signal, engine, events).await })
        };

        let follow_up_task = {
            let engine = engine.clone();
            let store = self.store.clone();
            let clock = self.clock.clone();
            tokio::spawn(async move { follow_up(engine, store, clock).await })
        };

        if self.sync_on_start && monitor.is_online() {
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.sync().await {
                    tracing::warn!("startup sync failed: {}", e);
                }
            });
        }

        Ok(OfflineService {
            store: self.store,
            engine,
            monitor,
            events,
            local_signal,
            monitor_task,
            follow_up_task,
        })
    }
}

/// Keep passes coming while online until the queue drains. After a pass that
/// left changes queued, wait for the earliest backoff gate; after a clean
/// pass, pick up changes queued while it ran.
async fn follow_up(engine: SyncEngine, store: StoreHandle, clock: Arc<dyn Clock>) {
    let mut state = engine.watch_state();
    while state.changed().await.is_ok() {
        let settled = *state.borrow_and_update();
        if !matches!(settled, SyncState::Succeeded | SyncState::Failed) || !engine.is_online() {
            continue;
        }

        let queued = match store.peek_all().await {
            Ok(queued) => queued,
            Err(e) => {
                tracing::warn!("follow-up sync could not read the queue: {}", e);
                continue;
            }
        };
        let now = clock.now();
        let Some(next) = queued
            .iter()
            .map(|change| change.next_attempt_at.unwrap_or(now))
            .min()
        else {
            continue;
        };

        let wait = (next - now).to_std().unwrap_or_default();
        if !wait.is_zero() {
            tracing::debug!("next sync attempt in {:?}", wait);
            tokio::time::sleep(wait).await;
        }
        match engine.sync().await {
            Ok(SyncOutcome::Completed(summary)) => {
                tracing::debug!("follow-up sync finished: {:?}", summary.result());
            }
            Ok(outcome) => tracing::debug!("follow-up sync skipped: {:?}", outcome),
            Err(e) => tracing::warn!("follow-up sync failed: {}", e),
        }
    }
}

/// The offline-first front door: every read and write goes to the local
/// store first, and queued changes drain to the remote in the background.
pub struct OfflineService {
    store: StoreHandle,
    engine: SyncEngine,
    monitor: Arc<ConnectivityMonitor>,
    events: broadcast::Sender<SyncEvent>,
    local_signal: Option<watch::Sender<bool>>,
    monitor_task: JoinHandle<()>,
    follow_up_task: JoinHandle<()>,
}

impl OfflineService {
    pub fn builder(store: StoreHandle) -> OfflineServiceBuilder {
        OfflineServiceBuilder {
            store,
            remote: None,
            signal: None,
            start_online: true,
            clock: Arc::new(SystemClock),
            policy: RetryPolicy::default(),
            sync_on_start: false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Events as a stream. A subscriber that falls behind skips the events it
    /// missed. The stream ends once the event channel closes.
    pub fn events(&self) -> impl Stream<Item = SyncEvent> + Send + 'static {
        stream::unfold(self.events.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("event subscriber lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    pub fn connectivity(&self) -> Connectivity {
        self.monitor.status()
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Feed a reachability reading when the service owns its signal.
    pub fn set_reachable(&self, reachable: bool) -> Result<Option<Transition>, ServiceError> {
        let signal = self
            .local_signal
            .as_ref()
            .ok_or(ServiceError::ExternalSignal)?;
        signal.send_replace(reachable);
        // Apply synchronously so callers observe the new status immediately;
        // the monitor task then sees an unchanged value and does nothing
        Ok(self.monitor.handle(reachable, &self.engine, &self.events))
    }

    pub fn sync_state(&self) -> SyncState {
        self.engine.state()
    }

    pub fn watch_sync_state(&self) -> watch::Receiver<SyncState> {
        self.engine.watch_state()
    }

    pub async fn sync(&self) -> Result<SyncOutcome, ServiceError> {
        Ok(self.engine.sync().await?)
    }

    pub async fn put(&self, entity_type: &str, entity: Entity) -> Result<WriteReceipt, ServiceError> {
        let receipt = self
            .store
            .put(entity_type, entity, self.connectivity())
            .await?;
        if receipt.change_id.is_some() {
            self.publish_pending_count().await?;
        }
        Ok(receipt)
    }

    pub async fn delete(&self, entity_type: &str, id: &str) -> Result<DeleteReceipt, ServiceError> {
        let receipt = self.store.delete(entity_type, id, self.connectivity()).await?;
        if receipt.change_id.is_some() {
            self.publish_pending_count().await?;
        }
        Ok(receipt)
    }

    pub async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, ServiceError> {
        Ok(self.store.get(entity_type, id).await?)
    }

    pub async fn list(
        &self,
        entity_type: &str,
        filter: EntityFilter,
    ) -> Result<Vec<Entity>, ServiceError> {
        Ok(self.store.list(entity_type, filter).await?)
    }

    pub async fn get_by_index(
        &self,
        entity_type: &str,
        index_name: &str,
        key: &str,
    ) -> Result<Vec<Entity>, ServiceError> {
        Ok(self.store.get_by_index(entity_type, index_name, key).await?)
    }

    pub async fn find_unique(
        &self,
        entity_type: &str,
        index_name: &str,
        key: &str,
    ) -> Result<Option<Entity>, ServiceError> {
        Ok(self.store.find_unique(entity_type, index_name, key).await?)
    }

    pub async fn pending_count(&self) -> Result<usize, ServiceError> {
        Ok(self.store.count().await?)
    }

    pub async fn pending(&self) -> Result<Vec<PendingChange>, ServiceError> {
        Ok(self.store.peek_all().await?)
    }

    pub async fn parked(&self) -> Result<Vec<PendingChange>, ServiceError> {
        Ok(self.store.parked().await?)
    }

    /// Discard an abandoned or rejected change.
    pub async fn dismiss(&self, id: Ulid) -> Result<bool, ServiceError> {
        Ok(self.store.dismiss(id).await?)
    }

    /// Put an abandoned or rejected change back in the queue with a fresh retry budget.
    pub async fn retry_parked(&self, id: Ulid) -> Result<(), ServiceError> {
        self.store.retry_parked(id).await?;
        self.publish_pending_count().await
    }

    pub async fn journal(&self) -> Result<Vec<JournalEntry>, ServiceError> {
        Ok(self.store.journal_entries().await?)
    }

    pub async fn store_migrant(&self, migrant: serde_json::Value) -> Result<WriteReceipt, ServiceError> {
        let entity = Entity::from_payload(migrant).ok_or(ServiceError::MissingId)?;
        self.put(MIGRANTS, entity).await
    }

    /// Look up a migrant by the QR code on their health card.
    pub async fn migrant_by_qr(&self, qr_code: &str) -> Result<Option<Entity>, ServiceError> {
        self.find_unique(MIGRANTS, "qr_code", qr_code).await
    }

    pub async fn migrants_by_phone(&self, phone: &str) -> Result<Vec<Entity>, ServiceError> {
        self.get_by_index(MIGRANTS, "phone", phone).await
    }

    pub async fn store_health_record(
        &self,
        record: serde_json::Value,
    ) -> Result<WriteReceipt, ServiceError> {
        let entity = Entity::from_payload(record).ok_or(ServiceError::MissingId)?;
        self.put(HEALTH_RECORDS, entity).await
    }

    pub async fn health_records_for(&self, migrant_id: &str) -> Result<Vec<Entity>, ServiceError> {
        self.get_by_index(HEALTH_RECORDS, "migrant_id", migrant_id)
            .await
    }

    pub async fn store_consent_record(
        &self,
        record: serde_json::Value,
    ) -> Result<WriteReceipt, ServiceError> {
        let entity = Entity::from_payload(record).ok_or(ServiceError::MissingId)?;
        self.put(CONSENT_RECORDS, entity).await
    }

    pub async fn consent_records_for(&self, migrant_id: &str) -> Result<Vec<Entity>, ServiceError> {
        self.get_by_index(CONSENT_RECORDS, "migrant_id", migrant_id)
            .await
    }

    /// Stop following connectivity and stop the engine from starting new work.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.monitor_task.abort();
        self.follow_up_task.abort();
        tracing::info!("offline service shut down");
    }

    async fn publish_pending_count(&self) -> Result<(), ServiceError> {
        let count = self.store.count().await?;
        let _ = self.events.send(SyncEvent::PendingCountChanged { count });
        Ok(())
    }
}

impl Drop for OfflineService {
    fn drop(&mut self) {
        self.monitor_task.abort();
        self.follow_up_task.abort();
    }
}
