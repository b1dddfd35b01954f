//! Persistent store for ovsnet networks and endpoints
//!
//! The single source of truth for which networks and endpoints the
//! controller believes exist. Survives restart; corrupt collections are
//! contained per file under a [`RecoveryPolicy`].

pub mod error;
pub mod records;
pub mod store;

pub use error::{Result, StoreError};
pub use records::{endpoint_key, EndpointRecord, NetworkRecord};
pub use store::{
    CollectionStatus, FileStore, RecoveryPolicy, RecoveryReport, StateStore, ENDPOINTS_FILE, NETWORKS_FILE,
};
