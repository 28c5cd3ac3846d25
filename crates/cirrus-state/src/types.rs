//! Domain types for the Cirrus control plane.
//!
//! These types represent tenants, instances, nodes, workloads, block
//! storage and the telemetry reported by compute nodes. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a tenant.
pub type TenantId = String;

/// Unique identifier for an instance.
pub type InstanceId = String;

/// Unique identifier for a compute node.
pub type NodeId = String;

// ── Resources ─────────────────────────────────────────────────────

/// Kinds of resources a tenant consumes and can be limited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Reserved resource counting live instances.
    Instances,
    Vcpus,
    MemMb,
    DiskMb,
    NetworkNode,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Instances,
        ResourceType::Vcpus,
        ResourceType::MemMb,
        ResourceType::DiskMb,
        ResourceType::NetworkNode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Instances => "instances",
            ResourceType::Vcpus => "vcpus",
            ResourceType::MemMb => "mem_mb",
            ResourceType::DiskMb => "disk_mb",
            ResourceType::NetworkNode => "network_node",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limit and current usage of one resource kind for a tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub rtype: ResourceType,
    /// `None` means unlimited.
    pub limit: Option<i64>,
    pub usage: i64,
}

/// A resource requirement declared by a workload template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedResource {
    pub rtype: ResourceType,
    pub value: i64,
}

// ── Tenant ────────────────────────────────────────────────────────

/// Public view of a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
    pub id: TenantId,
    /// Instance ID of the tenant's network concentrator, once launched.
    pub cnci_id: Option<InstanceId>,
    pub cnci_mac: String,
    pub cnci_ip: Option<String>,
    /// One entry per [`ResourceType`].
    pub resources: Vec<Resource>,
}

impl Tenant {
    /// A freshly registered tenant: no CNCI, unlimited and unused resources.
    pub fn new(id: &str, cnci_mac: &str) -> Self {
        Self {
            id: id.to_string(),
            cnci_id: None,
            cnci_mac: cnci_mac.to_string(),
            cnci_ip: None,
            resources: ResourceType::ALL
                .iter()
                .map(|&rtype| Resource {
                    rtype,
                    limit: None,
                    usage: 0,
                })
                .collect(),
        }
    }

    pub fn resource(&self, rtype: ResourceType) -> Option<&Resource> {
        self.resources.iter().find(|r| r.rtype == rtype)
    }

    pub fn resource_mut(&mut self, rtype: ResourceType) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.rtype == rtype)
    }
}

/// A tenant as persisted, together with its claimed addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRecord {
    pub tenant: Tenant,
    /// Claimed hosts per subnet.
    pub network: BTreeMap<u16, BTreeSet<u8>>,
}

/// Summary of a tenant's network concentrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantCnci {
    pub tenant_id: TenantId,
    pub instance_id: Option<InstanceId>,
    pub ip_address: Option<String>,
    pub mac_address: String,
    /// Owned subnets in CIDR notation.
    pub subnets: Vec<String>,
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of an instance as reported by its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Pending,
    Running,
    Exited,
    Stopping,
    Missing,
}

/// Where an instance accepts SSH connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshEndpoint {
    pub ip: String,
    pub port: u16,
}

/// A tenant workload launched (or being launched) on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub tenant_id: TenantId,
    pub workload_id: String,
    /// Empty until the instance is scheduled.
    pub node_id: Option<NodeId>,
    pub state: InstanceStatus,
    pub ip_address: String,
    pub mac_address: String,
    /// Usage copied from the workload defaults at creation.
    pub usage: BTreeMap<ResourceType, i64>,
    pub ssh: Option<SshEndpoint>,
    /// True for a tenant network concentrator.
    pub cnci: bool,
}

// ── Node ──────────────────────────────────────────────────────────

/// A compute host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
}

/// Instance counts per state for one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSummary {
    pub node_id: NodeId,
    pub total_instances: u32,
    pub total_running: u32,
    pub total_pending: u32,
    pub total_exited: u32,
}

// ── Workload ──────────────────────────────────────────────────────

/// Storage requested by a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageResource {
    /// Image or volume the root disk is created from.
    pub source_id: Option<String>,
    pub size_gb: u32,
    pub bootable: bool,
    pub ephemeral: bool,
}

/// Template instances are launched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workload {
    pub id: String,
    pub description: String,
    pub image_name: String,
    #[serde(default)]
    pub defaults: Vec<RequestedResource>,
    #[serde(default)]
    pub storage: Option<StorageResource>,
    /// Marks the network concentrator workload.
    #[serde(default)]
    pub cnci: bool,
}

impl Workload {
    /// Default usage map for an instance launched from this workload.
    pub fn default_usage(&self) -> BTreeMap<ResourceType, i64> {
        self.defaults.iter().map(|r| (r.rtype, r.value)).collect()
    }
}

// ── Block storage ─────────────────────────────────────────────────

/// Lifecycle state of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Available,
    Attaching,
    InUse,
    Detaching,
}

/// A block storage volume owned by a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockData {
    pub id: String,
    pub tenant_id: TenantId,
    pub size_gb: u64,
    pub state: BlockState,
    pub create_time: DateTime<Utc>,
}

/// Edge linking one instance to one volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StorageAttachment {
    pub id: String,
    pub instance_id: InstanceId,
    pub block_id: String,
}

// ── Telemetry ─────────────────────────────────────────────────────

/// Node availability as reported by the node itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Ready,
    Full,
    Offline,
    Maintenance,
}

/// Periodic report from a compute node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeStat {
    pub node_id: NodeId,
    pub hostname: String,
    pub status: NodeStatus,
    /// `-1` means node-level figures are unavailable.
    pub load: i32,
    pub mem_total_mb: i64,
    pub mem_available_mb: i64,
    pub disk_total_mb: i64,
    pub disk_available_mb: i64,
    pub cpus_online: i32,
    pub instances: Vec<InstanceStat>,
}

impl NodeStat {
    /// Load value meaning "skip the node-level update".
    pub const LOAD_UNAVAILABLE: i32 = -1;
}

/// Per-instance part of a [`NodeStat`]. Negative usage figures mean unknown.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceStat {
    pub instance_id: InstanceId,
    pub state: InstanceStatus,
    pub ssh_ip: String,
    pub ssh_port: u16,
    pub memory_usage_mb: i64,
    pub disk_usage_mb: i64,
    pub cpu_usage: i64,
    /// Volumes currently attached to the instance.
    pub volumes: Vec<String>,
}

/// Last known state of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputeNodeStats {
    pub id: NodeId,
    pub status: NodeStatus,
    pub load: i32,
    pub mem_total_mb: i64,
    pub mem_available_mb: i64,
    pub disk_total_mb: i64,
    pub disk_available_mb: i64,
    pub online_cpus: i32,
}

/// Last known state of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerStats {
    pub id: InstanceId,
    pub tenant_id: TenantId,
    pub node_id: Option<NodeId>,
    pub timestamp: DateTime<Utc>,
    pub status: InstanceStatus,
    pub vcpu_usage: i64,
    pub mem_usage_mb: i64,
    pub disk_usage_mb: i64,
}

/// Cumulative tenant resource usage at a point in time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageSample {
    pub timestamp: DateTime<Utc>,
    pub vcpu: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
}

/// Timing of one frame as seen by one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeTrace {
    pub node_id: NodeId,
    pub rx_timestamp: DateTime<Utc>,
    pub tx_timestamp: DateTime<Utc>,
}

/// A traced command frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameTrace {
    pub label: String,
    pub frame_type: String,
    pub operand: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub nodes: Vec<NodeTrace>,
}

/// A batch of traced frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trace {
    pub frames: Vec<FrameTrace>,
}

/// Number of frames recorded under a label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchFrameSummary {
    pub label: String,
    pub frames: u64,
    pub average_elapsed_ms: f64,
}

/// Per-node timing for the frames of one label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchFrameStat {
    pub node_id: NodeId,
    pub frames: u64,
    pub total_elapsed_ms: f64,
    pub average_elapsed_ms: f64,
}

// ── Event log ─────────────────────────────────────────────────────

/// Severity of a user-visible event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        })
    }
}

/// One entry of the tenant-scoped audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub tenant_id: TenantId,
    pub level: EventLevel,
    pub message: String,
}
