//! Client session: the shared credential cell, its persistence, and the
//! activity-driven keeper that renews it before it lapses.

pub mod credential;
pub mod keeper;
pub mod store;

pub use credential::{Credential, SessionContext};
pub use keeper::{
    ActivityBus, ActivityKind, CredentialRenewer, RefreshOutcome, RefreshPolicy, SessionKeeper, maybe_refresh,
};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
