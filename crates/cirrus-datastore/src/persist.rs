//! Write-behind persistence.
//!
//! Writes that tolerate staleness are described as [`PersistOp`]s and handed
//! to a [`Persister`]. In background mode a single task drains a bounded
//! queue in FIFO order; in inline mode each op is applied before `submit`
//! returns. Failures are logged and never retried.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cirrus_state::*;

use crate::config::{PersistMode, PersistenceConfig};

/// A single deferred store write.
#[derive(Debug)]
pub(crate) enum PersistOp {
    AddInstance(Instance),
    RemoveInstance(InstanceId),
    ClaimTenantIp {
        tenant_id: TenantId,
        subnet: u16,
        host: u8,
    },
    ReleaseTenantIp {
        tenant_id: TenantId,
        subnet: u16,
        host: u8,
    },
    NodeStat(NodeStat),
    InstanceStats {
        node_id: NodeId,
        stats: Vec<InstanceStat>,
    },
    CreateBlockData(BlockData),
    UpdateBlockData(BlockData),
    DeleteBlockData(String),
    CreateAttachment(StorageAttachment),
    DeleteAttachment(String),
    /// Acknowledged once every earlier op has been applied.
    Flush(oneshot::Sender<()>),
    /// Like `Flush`, then stops the worker.
    Shutdown(oneshot::Sender<()>),
}

impl PersistOp {
    fn kind(&self) -> &'static str {
        match self {
            PersistOp::AddInstance(_) => "add_instance",
            PersistOp::RemoveInstance(_) => "remove_instance",
            PersistOp::ClaimTenantIp { .. } => "claim_tenant_ip",
            PersistOp::ReleaseTenantIp { .. } => "release_tenant_ip",
            PersistOp::NodeStat(_) => "node_stat",
            PersistOp::InstanceStats { .. } => "instance_stats",
            PersistOp::CreateBlockData(_) => "create_block_data",
            PersistOp::UpdateBlockData(_) => "update_block_data",
            PersistOp::DeleteBlockData(_) => "delete_block_data",
            PersistOp::CreateAttachment(_) => "create_attachment",
            PersistOp::DeleteAttachment(_) => "delete_attachment",
            PersistOp::Flush(_) => "flush",
            PersistOp::Shutdown(_) => "shutdown",
        }
    }
}

/// Applies one op. Control ops are acknowledged here.
fn apply(store: &dyn PersistentStore, op: PersistOp) {
    let kind = op.kind();
    let result = match op {
        PersistOp::AddInstance(instance) => store.add_instance(&instance),
        PersistOp::RemoveInstance(id) => store.remove_instance(&id),
        PersistOp::ClaimTenantIp {
            tenant_id,
            subnet,
            host,
        } => store.claim_tenant_ip(&tenant_id, subnet, host),
        PersistOp::ReleaseTenantIp {
            tenant_id,
            subnet,
            host,
        } => store.release_tenant_ip(&tenant_id, subnet, host),
        PersistOp::NodeStat(stat) => store.add_node_stat(&stat),
        PersistOp::InstanceStats { node_id, stats } => store.add_instance_stats(&stats, &node_id),
        PersistOp::CreateBlockData(data) => store.create_block_data(&data),
        PersistOp::UpdateBlockData(data) => store.update_block_data(&data),
        PersistOp::DeleteBlockData(id) => store.delete_block_data(&id),
        PersistOp::CreateAttachment(attachment) => store.create_storage_attachment(&attachment),
        PersistOp::DeleteAttachment(id) => store.delete_storage_attachment(&id),
        PersistOp::Flush(ack) | PersistOp::Shutdown(ack) => {
            let _ = ack.send(());
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(op = kind, error = %e, "deferred store write failed");
    }
}

/// Front end of the write-behind path.
pub(crate) struct Persister {
    store: Arc<dyn PersistentStore>,
    /// `None` in inline mode.
    tx: Option<mpsc::Sender<PersistOp>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    /// Create a persister. Background mode spawns the worker, so this must
    /// run inside a tokio runtime.
    pub(crate) fn start(store: Arc<dyn PersistentStore>, config: &PersistenceConfig) -> Self {
        let (tx, worker) = match config.mode {
            PersistMode::Inline => (None, None),
            PersistMode::Background => {
                let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
                let worker = tokio::spawn(run_worker(store.clone(), rx));
                (Some(tx), Some(worker))
            }
        };
        debug!(mode = ?config.mode, queue_depth = config.queue_depth, "persister started");
        Self {
            store,
            tx,
            worker: Mutex::new(worker),
        }
    }

    /// Queue (or apply) a write. Waits only for queue capacity.
    pub(crate) async fn submit(&self, op: PersistOp) {
        match &self.tx {
            None => apply(self.store.as_ref(), op),
            Some(tx) => {
                if let Err(e) = tx.send(op).await {
                    warn!(op = e.0.kind(), "persistence queue closed, dropping write");
                }
            }
        }
    }

    /// Wait until every previously submitted write has been applied.
    pub(crate) async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.submit(PersistOp::Flush(ack)).await;
        // A closed queue has nothing left to drain.
        let _ = done.await;
    }

    /// Drain outstanding writes and stop the worker. Returns once the
    /// worker has released its handle on the store.
    pub(crate) async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        self.submit(PersistOp::Shutdown(ack)).await;
        let _ = done.await;
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "persistence worker panicked");
            }
        }
    }
}

async fn run_worker(store: Arc<dyn PersistentStore>, mut rx: mpsc::Receiver<PersistOp>) {
    debug!("persistence worker starting");
    let mut applied: u64 = 0;
    while let Some(op) = rx.recv().await {
        let stop = matches!(op, PersistOp::Shutdown(_));
        apply(store.as_ref(), op);
        applied += 1;
        if stop {
            break;
        }
    }
    info!(applied, "persistence worker stopped");
}
