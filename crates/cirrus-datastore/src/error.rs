//! Datastore error types.

use thiserror::Error;

/// Errors returned by [`Datastore`](crate::Datastore) operations.
#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("block device not found: {0}")]
    BlockDeviceNotFound(String),

    #[error("storage attachment not found: {0}")]
    StorageAttachmentNotFound(String),

    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("no CNCI workload in datastore")]
    NoCnciWorkload,

    #[error("no subnets left in the tenant address range")]
    OutOfSubnets,

    #[error("no free host in subnet {0:#06x}")]
    OutOfHosts(u16),

    #[error("invalid tenant address: {0}")]
    InvalidAddress(String),

    #[error("CNCI waiter for tenant {0} was dropped without a result")]
    CnciWaiterAbandoned(String),

    #[error("entropy source failed: {0}")]
    Entropy(String),

    #[error("state store error: {0}")]
    State(#[from] cirrus_state::StateError),
}

pub type DatastoreResult<T> = Result<T, DatastoreError>;
