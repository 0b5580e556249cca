// ABOUTME: Connectivity monitor turning an external reachability signal into online/offline transitions.
// ABOUTME: Publishes transitions as events and starts one sync pass each time the client comes back online.

use fieldsync_core::{Connectivity, SyncEvent};
use tokio::sync::{broadcast, watch};

use crate::engine::{SyncEngine, SyncOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Restored,
    WentOffline,
}

/// Current connectivity, shared with the sync engine through a watch channel.
pub struct ConnectivityMonitor {
    status: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (status, _) = watch::channel(initial);
        Self { status }
    }

    pub fn status(&self) -> Connectivity {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online()
    }

    /// Receiver the sync engine reads connectivity from.
    pub fn watcher(&self) -> watch::Receiver<Connectivity> {
        self.status.subscribe()
    }

    /// Apply one reachability reading. Repeating the current state is not a transition.
    pub fn observe(&self, reachable: bool) -> Option<Transition> {
        let next = Connectivity::from(reachable);
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        match (changed, next) {
            (false, _) => None,
            (true, Connectivity::Online) => Some(Transition::Restored),
            (true, Connectivity::Offline) => Some(Transition::WentOffline),
        }
    }

    /// Apply a reading and react to the transition it causes: publish the
    /// matching event and, when back online, start a sync pass in the background.
    pub fn handle(
        &self,
        reachable: bool,
        engine: &SyncEngine,
        events: &broadcast::Sender<SyncEvent>,
    ) -> Option<Transition> {
        let transition = self.observe(reachable)?;
        match transition {
            Transition::Restored => {
                tracing::info!("connectivity restored, starting sync");
                let _ = events.send(SyncEvent::ConnectivityRestored);
                let engine = engine.clone();
                tokio::spawn(async move {
                    match engine.sync().await {
                        Ok(SyncOutcome::Completed(summary)) => {
                            tracing::debug!("reconnect sync finished: {:?}", summary.result());
                        }
                        Ok(outcome) => tracing::debug!("reconnect sync skipped: {:?}", outcome),
                        Err(e) => tracing::warn!("reconnect sync failed: {}", e),
                    }
                });
            }
            Transition::WentOffline => {
                tracing::info!("connectivity lost, queuing writes locally");
                let _ = events.send(SyncEvent::WentOffline);
            }
        }
        Some(transition)
    }

    /// Follow `signal` until its sender is dropped.
    pub async fn run(
        &self,
        mut signal: watch::Receiver<bool>,
        engine: SyncEngine,
        events: broadcast::Sender<SyncEvent>,
    ) {
        loop {
            let reachable = *signal.borrow_and_update();
            self.handle(reachable, &engine, &events);
            if signal.changed().await.is_err() {
                tracing::debug!("reachability signal closed, monitor exiting");
                break;
            }
        }
    }
}
