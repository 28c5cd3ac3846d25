//! The capability the datastore cache requires from durable storage.
//!
//! Any backing technology can implement [`PersistentStore`]; the crate ships
//! the redb-backed [`StateStore`](crate::StateStore). Methods are synchronous
//! and must be callable from any thread.

use std::collections::HashMap;

use crate::error::StateResult;
use crate::types::*;

pub trait PersistentStore: Send + Sync + 'static {
    /// Release the backing database. Later calls fail with `StateError::Closed`.
    fn disconnect(&self);

    // ── Event log ──────────────────────────────────────────────────

    fn log_event(&self, tenant_id: &str, level: EventLevel, message: &str) -> StateResult<()>;
    fn clear_log(&self) -> StateResult<()>;
    fn event_log(&self) -> StateResult<Vec<LogEntry>>;

    // ── Workloads ──────────────────────────────────────────────────

    fn cnci_workload_id(&self) -> StateResult<Option<String>>;
    fn get_workload(&self, id: &str) -> StateResult<Option<Workload>>;
    fn list_workloads(&self) -> StateResult<Vec<Workload>>;
    fn put_workload(&self, workload: &Workload) -> StateResult<()>;
    fn workload_storage(&self, id: &str) -> StateResult<Option<StorageResource>>;

    // ── Tenants ────────────────────────────────────────────────────

    fn add_tenant(&self, id: &str, cnci_mac: &str) -> StateResult<()>;
    fn add_limit(&self, tenant_id: &str, rtype: ResourceType, limit: i64) -> StateResult<()>;
    fn get_tenant(&self, id: &str) -> StateResult<Option<TenantRecord>>;
    fn list_tenants(&self) -> StateResult<Vec<TenantRecord>>;
    /// Store the tenant's identity, CNCI and limit fields. Claims are untouched.
    fn update_tenant(&self, tenant: &Tenant) -> StateResult<()>;
    fn claim_tenant_ip(&self, tenant_id: &str, subnet: u16, host: u8) -> StateResult<()>;
    fn release_tenant_ip(&self, tenant_id: &str, subnet: u16, host: u8) -> StateResult<()>;

    // ── Instances ──────────────────────────────────────────────────

    fn list_instances(&self) -> StateResult<Vec<Instance>>;
    fn add_instance(&self, instance: &Instance) -> StateResult<()>;
    fn remove_instance(&self, id: &str) -> StateResult<()>;

    // ── Statistics ─────────────────────────────────────────────────

    fn add_node_stat(&self, stat: &NodeStat) -> StateResult<()>;
    fn node_summary(&self) -> StateResult<Vec<NodeSummary>>;
    fn add_instance_stats(&self, stats: &[InstanceStat], node_id: &str) -> StateResult<()>;
    fn add_frame_stat(&self, frame: &FrameTrace) -> StateResult<()>;
    fn batch_frame_summary(&self) -> StateResult<Vec<BatchFrameSummary>>;
    fn batch_frame_statistics(&self, label: &str) -> StateResult<Vec<BatchFrameStat>>;

    // ── Block storage ──────────────────────────────────────────────

    fn list_block_data(&self) -> StateResult<HashMap<String, BlockData>>;
    fn create_block_data(&self, data: &BlockData) -> StateResult<()>;
    fn update_block_data(&self, data: &BlockData) -> StateResult<()>;
    fn delete_block_data(&self, id: &str) -> StateResult<()>;
    fn tenant_devices(&self, tenant_id: &str) -> StateResult<HashMap<String, BlockData>>;
    fn create_storage_attachment(&self, attachment: &StorageAttachment) -> StateResult<()>;
    fn list_storage_attachments(&self) -> StateResult<HashMap<String, StorageAttachment>>;
    fn delete_storage_attachment(&self, id: &str) -> StateResult<()>;
}
