//! redb table definitions for the Cirrus persistent store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{parent_id}:{child}` so related rows can
//! be found with a prefix scan. Numeric key parts are zero-padded to keep the
//! lexicographic order equal to the numeric order.

use redb::TableDefinition;

/// Tenants keyed by `{tenant_id}`.
pub const TENANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");

/// Claimed tenant addresses keyed by `{tenant_id}:{subnet:05}:{host:03}`.
pub const TENANT_IPS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenant_ips");

/// Instances keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Workload templates keyed by `{workload_id}`.
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");

/// Node stats keyed by `{node_id}:{timestamp_nanos:020}:{seq:020}`.
pub const NODE_STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("node_stats");

/// Instance stats keyed by `{instance_id}:{timestamp_nanos:020}:{seq:020}`.
pub const INSTANCE_STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("instance_stats");

/// Trace frames keyed by `{label}:{timestamp_nanos:020}:{seq:020}`.
pub const FRAME_STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("frame_stats");

/// Event log keyed by `{timestamp_nanos:020}:{seq:020}`.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Block devices keyed by `{block_id}`.
pub const BLOCK_DATA: TableDefinition<&str, &[u8]> = TableDefinition::new("block_data");

/// Storage attachments keyed by `{attachment_id}`.
pub const ATTACHMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("attachments");
