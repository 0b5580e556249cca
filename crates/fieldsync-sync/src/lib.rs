// ABOUTME: Sync layer for fieldsync: remote service seam, HTTP client, connectivity monitor, and sync engine.
// ABOUTME: OfflineService ties them to the local store handle behind one offline-first API.

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod http;
pub mod remote;
pub mod service;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ConfigError, SyncConfig};
pub use connectivity::{ConnectivityMonitor, Transition};
pub use engine::{SyncEngine, SyncError, SyncOutcome, SyncState};
pub use http::{EndpointError, HttpRemote};
pub use remote::{RemoteError, RemoteRequest, RemoteService};
pub use service::{OfflineService, OfflineServiceBuilder, ServiceError};
