// ABOUTME: Core library for fieldsync, containing the domain types shared by the store and sync engine.
// ABOUTME: Defines entities, pending changes, collection schema, UI events, clocks, and retry policy.

pub mod change;
pub mod clock;
pub mod connectivity;
pub mod entity;
pub mod event;
pub mod policy;
pub mod schema;

pub use change::{ChangeKind, ChangeState, ParseEnumError, PendingChange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connectivity::Connectivity;
pub use entity::{Entity, SyncStatus};
pub use event::{SyncEvent, SyncResult, SyncSummary};
pub use policy::RetryPolicy;
pub use schema::{CONSENT_RECORDS, CollectionDef, HEALTH_RECORDS, IndexDef, MIGRANTS, Schema};
