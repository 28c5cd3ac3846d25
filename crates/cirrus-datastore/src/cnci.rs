//! One-shot rendezvous between a caller waiting for a tenant's CNCI and the
//! telemetry path that learns whether it came up.

use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::error::{DatastoreError, DatastoreResult};

/// Pending waiters keyed by tenant.
#[derive(Default)]
pub(crate) struct CnciRegistry {
    waiters: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl CnciRegistry {
    /// Register a waiter, replacing any earlier one for the same tenant.
    pub(crate) async fn register(&self, tenant_id: &str) -> CnciWaiter {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().await;
        if waiters.insert(tenant_id.to_string(), tx).is_some() {
            debug!(%tenant_id, "replaced pending CNCI waiter");
        }
        CnciWaiter {
            tenant_id: tenant_id.to_string(),
            rx,
        }
    }

    /// Deliver `ready` to the tenant's waiter, if any. Returns true if a
    /// registration was consumed.
    pub(crate) async fn signal(&self, tenant_id: &str, ready: bool) -> bool {
        let Some(tx) = self.waiters.lock().await.remove(tenant_id) else {
            return false;
        };
        // The waiter may have been dropped already; the registration is gone either way.
        let _ = tx.send(ready);
        debug!(%tenant_id, ready, "CNCI waiter signalled");
        true
    }

    #[cfg(test)]
    pub(crate) async fn pending(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

/// Receives exactly one CNCI outcome for a tenant.
#[derive(Debug)]
pub struct CnciWaiter {
    tenant_id: String,
    rx: oneshot::Receiver<bool>,
}

impl CnciWaiter {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// `true` once the CNCI has an address, `false` if it failed to start.
    /// There is no timeout; wrap in `tokio::time::timeout` if one is needed.
    pub async fn wait(self) -> DatastoreResult<bool> {
        self.rx
            .await
            .map_err(|_| DatastoreError::CnciWaiterAbandoned(self.tenant_id))
    }
}
