//! cirrus-datastore: the controller's cached view of the cluster.
//!
//! [`Datastore`] keeps tenants, instances, nodes, workloads, block devices
//! and attachments in memory and writes them through to a
//! [`PersistentStore`](cirrus_state::PersistentStore). It also owns:
//!
//! - the per-tenant address allocator ([`network`])
//! - tenant usage history fed by instance telemetry ([`usage`])
//! - the storage attachment reconciler
//! - the CNCI rendezvous ([`CnciWaiter`])
//! - compensating actions for failures reported by nodes
//!
//! # Architecture
//!
//! ```text
//! Datastore (Clone, Arc inside)
//!   ├── RwLock per map (instances, tenants, nodes, ...)
//!   ├── Persister ──mpsc──▶ background writer ──▶ PersistentStore
//!   └── CnciRegistry (tenant → oneshot::Sender<bool>)
//! ```

pub mod cnci;
pub mod config;
pub mod datastore;
pub mod error;
pub mod failures;
pub mod network;
mod persist;
mod stats;
mod storage;
pub mod usage;

pub use cnci::CnciWaiter;
pub use config::{CacheConfig, DatastoreConfig, PersistMode, PersistenceConfig};
pub use datastore::Datastore;
pub use error::{DatastoreError, DatastoreResult};
pub use failures::{RestartFailureReason, StartFailureReason, StopFailureReason, VolumeFailureReason};
pub use usage::{UsageDelta, UsageHistory};
