//! The controller datastore: an in-memory cache of tenants, instances, nodes
//! and workloads in front of a [`PersistentStore`].
//!
//! Each map sits behind its own `RwLock`. Operations touching several maps
//! take the locks in this order and never the other way round:
//!
//! ```text
//! instances → instance_last_stats → attachments → tenants → nodes
//!   → node_last_stats → block_devices → tenant_usage → workloads → cnci_waiters
//! ```
//!
//! Writes that may lag behind the cache go through the [`Persister`]; tenant
//! creation, limits and CNCI updates are written synchronously.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use cirrus_state::*;

use crate::cnci::{CnciRegistry, CnciWaiter};
use crate::config::DatastoreConfig;
use crate::error::{DatastoreError, DatastoreResult};
use crate::network::{self, SubnetPool, TenantNetwork};
use crate::persist::{PersistOp, Persister};
use crate::storage::AttachmentIndex;
use crate::usage::UsageHistory;

/// A cached tenant and the indices hanging off it.
pub(crate) struct TenantEntry {
    pub(crate) tenant: Tenant,
    pub(crate) network: TenantNetwork,
    pub(crate) instances: HashSet<InstanceId>,
    pub(crate) devices: HashSet<String>,
}

impl TenantEntry {
    /// Stored usage figures are ignored; usage is rebuilt from cached instances.
    fn from_record(record: TenantRecord) -> Self {
        let mut tenant = record.tenant;
        for resource in &mut tenant.resources {
            resource.usage = 0;
        }
        Self {
            network: TenantNetwork::from_claims(&record.network),
            tenant,
            instances: HashSet::new(),
            devices: HashSet::new(),
        }
    }

    /// Add (`sign = 1`) or remove (`sign = -1`) one instance's usage,
    /// including the reserved instance count.
    fn apply_usage(&mut self, usage: &BTreeMap<ResourceType, i64>, sign: i64) {
        for (&rtype, &value) in usage {
            if rtype == ResourceType::Instances {
                continue;
            }
            if let Some(resource) = self.tenant.resource_mut(rtype) {
                resource.usage += sign * value;
            }
        }
        if let Some(resource) = self.tenant.resource_mut(ResourceType::Instances) {
            resource.usage += sign;
        }
    }
}

/// Tenants plus the process-wide subnet ownership they share.
#[derive(Default)]
pub(crate) struct TenantTable {
    pub(crate) entries: HashMap<TenantId, TenantEntry>,
    pub(crate) pool: SubnetPool,
}

impl TenantTable {
    /// Cache a tenant read from the store. An entry that is already cached wins.
    fn insert_record(&mut self, record: TenantRecord) -> &mut TenantEntry {
        for &subnet in record.network.keys() {
            self.pool.reserve(subnet);
        }
        self.entries
            .entry(record.tenant.id.clone())
            .or_insert_with(|| TenantEntry::from_record(record))
    }

    fn find_by_cnci_mac(&mut self, mac: &str) -> Option<&mut TenantEntry> {
        self.entries
            .values_mut()
            .find(|entry| entry.tenant.cnci_mac == mac)
    }
}

/// A compute node and the instances believed to run on it.
pub(crate) struct NodeEntry {
    pub(crate) node: Node,
    pub(crate) instances: HashSet<InstanceId>,
}

impl NodeEntry {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            node: Node {
                id: id.to_string(),
                hostname: String::new(),
            },
            instances: HashSet::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct WorkloadCache {
    pub(crate) by_id: HashMap<String, Workload>,
    pub(crate) cnci_id: Option<String>,
}

/// Shared handle to the controller's cached state. Cloning is cheap.
#[derive(Clone)]
pub struct Datastore {
    pub(crate) store: Arc<dyn PersistentStore>,
    pub(crate) persister: Arc<Persister>,
    pub(crate) config: Arc<DatastoreConfig>,
    pub(crate) instances: Arc<RwLock<HashMap<InstanceId, Instance>>>,
    pub(crate) instance_last_stats: Arc<RwLock<HashMap<InstanceId, ServerStats>>>,
    pub(crate) attachments: Arc<RwLock<AttachmentIndex>>,
    pub(crate) tenants: Arc<RwLock<TenantTable>>,
    pub(crate) nodes: Arc<RwLock<HashMap<NodeId, NodeEntry>>>,
    pub(crate) node_last_stats: Arc<RwLock<HashMap<NodeId, ComputeNodeStats>>>,
    pub(crate) block_devices: Arc<RwLock<HashMap<String, BlockData>>>,
    pub(crate) tenant_usage: Arc<RwLock<HashMap<TenantId, UsageHistory>>>,
    pub(crate) workloads: Arc<RwLock<WorkloadCache>>,
    pub(crate) cnci_waiters: Arc<CnciRegistry>,
}

/// Log a failed warm-up read and fall back to an empty cache.
fn load_or_default<T: Default>(what: &str, result: StateResult<T>) -> T {
    result.unwrap_or_else(|e| {
        error!(table = what, error = %e, "failed to load from store, starting empty");
        T::default()
    })
}

fn seed_stats(instance: &Instance) -> ServerStats {
    ServerStats {
        id: instance.id.clone(),
        tenant_id: instance.tenant_id.clone(),
        node_id: instance.node_id.clone(),
        timestamp: Utc::now(),
        status: instance.state,
        vcpu_usage: 0,
        mem_usage_mb: 0,
        disk_usage_mb: 0,
    }
}

/// 48 random bits, locally administered, second octet never zero.
fn generate_cnci_mac() -> DatastoreResult<String> {
    let mut buf = [0u8; 6];
    getrandom::getrandom(&mut buf).map_err(|e| DatastoreError::Entropy(e.to_string()))?;
    buf[0] = 0x02;
    if buf[1] == 0 {
        buf[1] = 0x03;
    }
    Ok(buf
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

impl Datastore {
    /// Warm the cache from `store`. Must be called inside a tokio runtime
    /// when background persistence is configured.
    pub fn init(store: Arc<dyn PersistentStore>, config: DatastoreConfig) -> Self {
        let instance_list = load_or_default("instances", store.list_instances());
        let tenant_list = load_or_default("tenants", store.list_tenants());
        let workload_list = load_or_default("workloads", store.list_workloads());
        let cnci_id = load_or_default("workloads", store.cnci_workload_id());
        let block_data = load_or_default("block_data", store.list_block_data());
        let attachment_map = load_or_default("attachments", store.list_storage_attachments());

        let mut tenants = TenantTable::default();
        for record in tenant_list {
            tenants.insert_record(record);
        }

        let mut instances = HashMap::new();
        let mut last_stats = HashMap::new();
        let mut nodes: HashMap<NodeId, NodeEntry> = HashMap::new();
        for instance in instance_list {
            match tenants.entries.get_mut(&instance.tenant_id) {
                Some(entry) => {
                    entry.apply_usage(&instance.usage, 1);
                    entry.instances.insert(instance.id.clone());
                }
                None => warn!(instance_id = %instance.id, tenant_id = %instance.tenant_id, "instance of unknown tenant"),
            }
            if let Some(node_id) = &instance.node_id {
                nodes
                    .entry(node_id.clone())
                    .or_insert_with(|| NodeEntry::new(node_id))
                    .instances
                    .insert(instance.id.clone());
            }
            last_stats.insert(instance.id.clone(), seed_stats(&instance));
            instances.insert(instance.id.clone(), instance);
        }

        for device in block_data.values() {
            if let Some(entry) = tenants.entries.get_mut(&device.tenant_id) {
                entry.devices.insert(device.id.clone());
            }
        }

        let mut attachments = AttachmentIndex::default();
        for attachment in attachment_map.into_values() {
            attachments.insert(attachment);
        }

        let workloads = WorkloadCache {
            by_id: workload_list.into_iter().map(|w| (w.id.clone(), w)).collect(),
            cnci_id,
        };

        info!(
            tenants = tenants.entries.len(),
            instances = instances.len(),
            nodes = nodes.len(),
            workloads = workloads.by_id.len(),
            block_devices = block_data.len(),
            attachments = attachments.len(),
            "datastore initialised"
        );

        let persister = Persister::start(store.clone(), &config.persistence);
        Self {
            store,
            persister: Arc::new(persister),
            config: Arc::new(config),
            instances: Arc::new(RwLock::new(instances)),
            instance_last_stats: Arc::new(RwLock::new(last_stats)),
            attachments: Arc::new(RwLock::new(attachments)),
            tenants: Arc::new(RwLock::new(tenants)),
            nodes: Arc::new(RwLock::new(nodes)),
            node_last_stats: Arc::new(RwLock::new(HashMap::new())),
            block_devices: Arc::new(RwLock::new(block_data)),
            tenant_usage: Arc::new(RwLock::new(HashMap::new())),
            workloads: Arc::new(RwLock::new(workloads)),
            cnci_waiters: Arc::new(CnciRegistry::default()),
        }
    }

    /// Wait until every queued write has reached the store.
    pub async fn flush(&self) {
        self.persister.flush().await;
    }

    /// Drain queued writes and disconnect the store.
    pub async fn exit(&self) {
        self.persister.shutdown().await;
        self.store.disconnect();
        info!("datastore closed");
    }

    /// Append a tenant-scoped event. Failures are logged only.
    pub(crate) fn log_event(&self, tenant_id: &str, level: EventLevel, message: &str) {
        if let Err(e) = self.store.log_event(tenant_id, level, message) {
            warn!(%tenant_id, %level, error = %e, "failed to append event");
        }
    }

    // ── Tenants ────────────────────────────────────────────────────

    /// Register a tenant with a fresh CNCI MAC. Returns the cached tenant
    /// unchanged if it already exists.
    pub async fn add_tenant(&self, tenant_id: &str) -> DatastoreResult<Tenant> {
        if let Some(entry) = self.tenants.read().await.entries.get(tenant_id) {
            return Ok(entry.tenant.clone());
        }

        let mac = generate_cnci_mac()?;
        self.store.add_tenant(tenant_id, &mac)?;
        let record = self
            .store
            .get_tenant(tenant_id)?
            .ok_or_else(|| DatastoreError::TenantNotFound(tenant_id.to_string()))?;

        let tenant = self.cache_tenant_record(record).await;
        info!(%tenant_id, cnci_mac = %tenant.cnci_mac, "tenant added");
        Ok(tenant)
    }

    /// Cache a stored tenant, charging it for instances already cached.
    async fn cache_tenant_record(&self, record: TenantRecord) -> Tenant {
        let tenant_id = record.tenant.id.clone();
        let instances = self.instances.read().await;
        let mut tenants = self.tenants.write().await;
        let entry = tenants.insert_record(record);
        for instance in instances.values().filter(|i| i.tenant_id == tenant_id) {
            if entry.instances.insert(instance.id.clone()) {
                entry.apply_usage(&instance.usage, 1);
            }
        }
        entry.tenant.clone()
    }

    /// Look a tenant up in the cache, falling back to the store.
    pub async fn get_tenant(&self, tenant_id: &str) -> DatastoreResult<Option<Tenant>> {
        if let Some(entry) = self.tenants.read().await.entries.get(tenant_id) {
            return Ok(Some(entry.tenant.clone()));
        }

        let Some(record) = self.store.get_tenant(tenant_id)? else {
            return Ok(None);
        };
        if !self.config.cache.backfill_tenants_on_miss {
            return Ok(Some(record.tenant));
        }

        debug!(%tenant_id, "backfilling tenant from store");
        Ok(Some(self.cache_tenant_record(record).await))
    }

    pub async fn get_all_tenants(&self) -> DatastoreResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = {
            let cached = self.tenants.read().await;
            cached.entries.values().map(|e| e.tenant.clone()).collect()
        };
        if tenants.is_empty() {
            tenants = self
                .store
                .list_tenants()?
                .into_iter()
                .map(|record| record.tenant)
                .collect();
        }
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    /// Set a resource limit, writing to the store first.
    pub async fn add_limit(&self, tenant_id: &str, rtype: ResourceType, limit: i64) -> DatastoreResult<()> {
        match self.store.add_limit(tenant_id, rtype, limit) {
            Err(StateError::NotFound(_)) => {
                return Err(DatastoreError::TenantNotFound(tenant_id.to_string()));
            }
            result => result?,
        }

        let mut tenants = self.tenants.write().await;
        if let Some(entry) = tenants.entries.get_mut(tenant_id) {
            match entry.tenant.resource_mut(rtype) {
                Some(resource) => resource.limit = Some(limit),
                None => entry.tenant.resources.push(Resource {
                    rtype,
                    limit: Some(limit),
                    usage: 0,
                }),
            }
        }
        info!(%tenant_id, resource = %rtype, limit, "tenant limit set");
        Ok(())
    }

    /// Apply `update` to a cached tenant and store the result synchronously.
    async fn update_tenant_with(&self, tenant_id: &str, update: impl FnOnce(&mut Tenant)) -> DatastoreResult<()> {
        let mut tenants = self.tenants.write().await;
        let entry = tenants
            .entries
            .get_mut(tenant_id)
            .ok_or_else(|| DatastoreError::TenantNotFound(tenant_id.to_string()))?;
        update(&mut entry.tenant);
        self.store.update_tenant(&entry.tenant)?;
        Ok(())
    }

    /// Record the tenant's CNCI instance and its MAC.
    pub async fn add_tenant_cnci(&self, tenant_id: &str, instance_id: &str, mac: &str) -> DatastoreResult<()> {
        self.update_tenant_with(tenant_id, |tenant| {
            tenant.cnci_id = Some(instance_id.to_string());
            tenant.cnci_mac = mac.to_string();
        })
        .await?;
        info!(%tenant_id, %instance_id, %mac, "tenant CNCI recorded");
        Ok(())
    }

    /// Record the address the CNCI with `mac` came up on and wake the
    /// tenant's waiter with `true`.
    pub async fn add_cnci_ip(&self, mac: &str, ip: &str) -> DatastoreResult<()> {
        let (tenant_id, result) = {
            let mut tenants = self.tenants.write().await;
            let entry = tenants
                .find_by_cnci_mac(mac)
                .ok_or_else(|| DatastoreError::TenantNotFound(format!("CNCI MAC {mac}")))?;
            entry.tenant.cnci_ip = Some(ip.to_string());
            (entry.tenant.id.clone(), self.store.update_tenant(&entry.tenant))
        };

        info!(%tenant_id, %mac, %ip, "tenant CNCI address recorded");
        self.cnci_waiters.signal(&tenant_id, true).await;
        result.map_err(DatastoreError::from)
    }

    /// Forget the tenant's CNCI instance and address.
    pub(crate) async fn remove_tenant_cnci(&self, tenant_id: &str) -> DatastoreResult<()> {
        self.update_tenant_with(tenant_id, |tenant| {
            tenant.cnci_id = None;
            tenant.cnci_ip = None;
        })
        .await?;
        info!(%tenant_id, "tenant CNCI removed");
        Ok(())
    }

    /// CNCI details of every tenant, or of the tenant whose CNCI is `cnci_id`.
    pub async fn get_tenant_cnci_summary(&self, cnci_id: Option<&str>) -> Vec<TenantCnci> {
        let tenants = self.tenants.read().await;
        let mut summary: Vec<TenantCnci> = tenants
            .entries
            .values()
            .filter(|e| cnci_id.is_none_or(|id| e.tenant.cnci_id.as_deref() == Some(id)))
            .map(|e| TenantCnci {
                tenant_id: e.tenant.id.clone(),
                instance_id: e.tenant.cnci_id.clone(),
                ip_address: e.tenant.cnci_ip.clone(),
                mac_address: e.tenant.cnci_mac.clone(),
                subnets: e.network.subnets().map(network::subnet_cidr).collect(),
            })
            .collect();
        summary.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        summary
    }

    /// Register interest in the tenant's CNCI coming up (or failing to).
    pub async fn register_cnci_waiter(&self, tenant_id: &str) -> CnciWaiter {
        self.cnci_waiters.register(tenant_id).await
    }

    // ── Tenant network ─────────────────────────────────────────────

    /// Claim the next free address for a tenant.
    pub async fn allocate_tenant_ip(&self, tenant_id: &str) -> DatastoreResult<Ipv4Addr> {
        let (subnet, host) = {
            let mut guard = self.tenants.write().await;
            let TenantTable { entries, pool } = &mut *guard;
            let entry = entries
                .get_mut(tenant_id)
                .ok_or_else(|| DatastoreError::TenantNotFound(tenant_id.to_string()))?;
            entry.network.allocate(pool)?
        };

        self.persister
            .submit(PersistOp::ClaimTenantIp {
                tenant_id: tenant_id.to_string(),
                subnet,
                host,
            })
            .await;
        let address = network::format_address(subnet, host);
        debug!(%tenant_id, %address, "tenant address allocated");
        Ok(address)
    }

    /// Return an address to the tenant's pool. Unclaimed addresses are ignored.
    pub async fn release_tenant_ip(&self, tenant_id: &str, address: &str) -> DatastoreResult<()> {
        let (subnet, host) = network::parse_address(address)?;
        let released = {
            let mut tenants = self.tenants.write().await;
            let entry = tenants
                .entries
                .get_mut(tenant_id)
                .ok_or_else(|| DatastoreError::TenantNotFound(tenant_id.to_string()))?;
            entry.network.release(subnet, host)
        };

        if released {
            self.persister
                .submit(PersistOp::ReleaseTenantIp {
                    tenant_id: tenant_id.to_string(),
                    subnet,
                    host,
                })
                .await;
            debug!(%tenant_id, %address, "tenant address released");
        }
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Cache a new instance and charge its usage to the tenant.
    pub async fn add_instance(&self, instance: Instance) -> DatastoreResult<()> {
        {
            let mut instances = self.instances.write().await;
            let mut last_stats = self.instance_last_stats.write().await;
            last_stats.insert(instance.id.clone(), seed_stats(&instance));
            instances.insert(instance.id.clone(), instance.clone());
        }

        {
            let mut tenants = self.tenants.write().await;
            match tenants.entries.get_mut(&instance.tenant_id) {
                Some(entry) => {
                    if entry.instances.insert(instance.id.clone()) {
                        entry.apply_usage(&instance.usage, 1);
                    }
                }
                None => warn!(instance_id = %instance.id, tenant_id = %instance.tenant_id, "instance added for uncached tenant"),
            }
        }

        if let Some(node_id) = &instance.node_id {
            let mut nodes = self.nodes.write().await;
            nodes
                .entry(node_id.clone())
                .or_insert_with(|| NodeEntry::new(node_id))
                .instances
                .insert(instance.id.clone());
        }

        debug!(instance_id = %instance.id, tenant_id = %instance.tenant_id, "instance added");
        self.persister.submit(PersistOp::AddInstance(instance)).await;
        Ok(())
    }

    /// Delete an instance and undo everything `add_instance` did.
    pub async fn delete_instance(&self, instance_id: &str) -> DatastoreResult<()> {
        let instance = self.remove_instance(instance_id).await?;
        self.log_event(
            &instance.tenant_id,
            EventLevel::Info,
            &format!("Deleted Instance {instance_id}"),
        );
        info!(%instance_id, tenant_id = %instance.tenant_id, "instance deleted");
        Ok(())
    }

    /// The deletion itself, without the user-visible event.
    pub(crate) async fn remove_instance(&self, instance_id: &str) -> DatastoreResult<Instance> {
        let (instance, released) = {
            let mut instances = self.instances.write().await;
            let instance = instances
                .remove(instance_id)
                .ok_or_else(|| DatastoreError::InstanceNotFound(instance_id.to_string()))?;
            self.instance_last_stats.write().await.remove(instance_id);

            let mut released = None;
            {
                let mut tenants = self.tenants.write().await;
                if let Some(entry) = tenants.entries.get_mut(&instance.tenant_id) {
                    if entry.instances.remove(instance_id) {
                        entry.apply_usage(&instance.usage, -1);
                    }
                    match network::parse_address(&instance.ip_address) {
                        Ok((subnet, host)) => {
                            if entry.network.release(subnet, host) {
                                released = Some((subnet, host));
                            }
                        }
                        Err(e) => debug!(%instance_id, error = %e, "instance holds no tenant address"),
                    }
                }

                if let Some(node_id) = &instance.node_id {
                    let mut nodes = self.nodes.write().await;
                    if let Some(node) = nodes.get_mut(node_id) {
                        node.instances.remove(instance_id);
                    }
                }
            }
            (instance, released)
        };

        self.persister
            .submit(PersistOp::RemoveInstance(instance.id.clone()))
            .await;
        if let Some((subnet, host)) = released {
            self.persister
                .submit(PersistOp::ReleaseTenantIp {
                    tenant_id: instance.tenant_id.clone(),
                    subnet,
                    host,
                })
                .await;
        }
        Ok(instance)
    }

    pub async fn get_instance(&self, instance_id: &str) -> DatastoreResult<Instance> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| DatastoreError::InstanceNotFound(instance_id.to_string()))
    }

    pub async fn get_all_instances(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.instances.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn get_all_instances_from_tenant(&self, tenant_id: &str) -> DatastoreResult<Vec<Instance>> {
        let instances = self.instances.read().await;
        let tenants = self.tenants.read().await;
        let entry = tenants
            .entries
            .get(tenant_id)
            .ok_or_else(|| DatastoreError::TenantNotFound(tenant_id.to_string()))?;
        let mut owned: Vec<Instance> = entry
            .instances
            .iter()
            .filter_map(|id| instances.get(id).cloned())
            .collect();
        owned.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(owned)
    }

    /// Instances believed to run on `node_id`. Unknown nodes have none.
    pub async fn get_all_instances_by_node(&self, node_id: &str) -> Vec<Instance> {
        let instances = self.instances.read().await;
        let nodes = self.nodes.read().await;
        let mut hosted: Vec<Instance> = nodes
            .get(node_id)
            .map(|node| {
                node.instances
                    .iter()
                    .filter_map(|id| instances.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        hosted.sort_by(|a, b| a.id.cmp(&b.id));
        hosted
    }

    pub async fn get_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().await.get(node_id).map(|entry| entry.node.clone())
    }

    /// Drop a node from the cache. Its instances are left alone.
    pub async fn delete_node(&self, node_id: &str) {
        let mut nodes = self.nodes.write().await;
        let mut last_stats = self.node_last_stats.write().await;
        if nodes.remove(node_id).is_some() {
            info!(%node_id, "node deleted");
        }
        last_stats.remove(node_id);
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Look a workload up, reading through to the store on a miss.
    pub async fn get_workload(&self, workload_id: &str) -> DatastoreResult<Workload> {
        if let Some(workload) = self.workloads.read().await.by_id.get(workload_id) {
            return Ok(workload.clone());
        }
        let workload = self
            .store
            .get_workload(workload_id)?
            .ok_or_else(|| DatastoreError::WorkloadNotFound(workload_id.to_string()))?;
        let mut workloads = self.workloads.write().await;
        workloads
            .by_id
            .insert(workload.id.clone(), workload.clone());
        Ok(workload)
    }

    pub async fn get_workloads(&self) -> DatastoreResult<Vec<Workload>> {
        let mut workloads = self.workloads.write().await;
        if workloads.by_id.is_empty() {
            for workload in self.store.list_workloads()? {
                workloads.by_id.insert(workload.id.clone(), workload);
            }
        }
        let mut all: Vec<Workload> = workloads.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    pub async fn get_cnci_workload_id(&self) -> DatastoreResult<String> {
        self.workloads
            .read()
            .await
            .cnci_id
            .clone()
            .ok_or(DatastoreError::NoCnciWorkload)
    }

    // ── Event log ──────────────────────────────────────────────────

    pub async fn get_event_log(&self) -> DatastoreResult<Vec<LogEntry>> {
        Ok(self.store.event_log()?)
    }

    pub async fn clear_log(&self) -> DatastoreResult<()> {
        self.store.clear_log()?;
        info!("event log cleared");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_workload(id: &str, cnci: bool) -> Workload {
        Workload {
            id: id.to_string(),
            description: format!("{id} workload"),
            image_name: "ubuntu-server".to_string(),
            defaults: vec![
                RequestedResource {
                    rtype: ResourceType::Vcpus,
                    value: 2,
                },
                RequestedResource {
                    rtype: ResourceType::MemMb,
                    value: 512,
                },
            ],
            storage: None,
            cnci,
        }
    }

    /// Inline persistence over an in-memory store with one workload seeded.
    pub(crate) fn test_datastore() -> (Datastore, Arc<StateStore>) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store.put_workload(&test_workload("wl-1", false)).unwrap();
        store.put_workload(&test_workload("wl-cnci", true)).unwrap();
        let ds = Datastore::init(store.clone(), DatastoreConfig::inline());
        (ds, store)
    }

    /// Build an instance for `tenant_id` with a freshly allocated address.
    pub(crate) async fn new_instance(ds: &Datastore, id: &str, tenant_id: &str) -> Instance {
        let workload = ds.get_workload("wl-1").await.unwrap();
        let ip = ds.allocate_tenant_ip(tenant_id).await.unwrap();
        Instance {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            workload_id: workload.id.clone(),
            node_id: None,
            state: InstanceStatus::Pending,
            ip_address: ip.to_string(),
            mac_address: "02:00:ac:10:00:02".to_string(),
            usage: workload.default_usage(),
            ssh: None,
            cnci: false,
        }
    }

    fn usage_of(tenant: &Tenant, rtype: ResourceType) -> i64 {
        tenant.resource(rtype).unwrap().usage
    }

    #[test]
    fn cnci_mac_is_locally_administered() {
        for _ in 0..64 {
            let mac = generate_cnci_mac().unwrap();
            let octets: Vec<u8> = mac
                .split(':')
                .map(|o| u8::from_str_radix(o, 16).unwrap())
                .collect();
            assert_eq!(octets.len(), 6);
            assert_eq!(octets[0], 0x02);
            assert_ne!(octets[1], 0);
        }
    }

    // ── Tenants ────────────────────────────────────────────────────

    #[tokio::test]
    async fn add_tenant_caches_and_persists() {
        let (ds, store) = test_datastore();
        let tenant = ds.add_tenant("t1").await.unwrap();
        assert!(tenant.cnci_mac.starts_with("02:"));

        // Served from cache even after the store row changes.
        let mut changed = tenant.clone();
        changed.cnci_ip = Some("10.0.0.1".to_string());
        store.update_tenant(&changed).unwrap();
        assert_eq!(ds.get_tenant("t1").await.unwrap(), Some(tenant.clone()));

        // Re-adding returns the cached tenant unchanged.
        assert_eq!(ds.add_tenant("t1").await.unwrap(), tenant);
    }

    #[tokio::test]
    async fn get_tenant_miss_backfills_by_default() {
        let (ds, store) = test_datastore();
        store.add_tenant("t2", "02:03:00:00:00:02").unwrap();

        assert!(ds.get_all_tenants().await.unwrap().iter().any(|t| t.id == "t2"));
        let tenant = ds.get_tenant("t2").await.unwrap().unwrap();
        assert_eq!(tenant.cnci_mac, "02:03:00:00:00:02");
        assert!(ds.tenants.read().await.entries.contains_key("t2"));
    }

    #[tokio::test]
    async fn get_tenant_miss_without_backfill_leaves_cache_cold() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut config = DatastoreConfig::inline();
        config.cache.backfill_tenants_on_miss = false;
        let ds = Datastore::init(store.clone(), config);
        store.add_tenant("t2", "02:03:00:00:00:02").unwrap();

        assert!(ds.get_tenant("t2").await.unwrap().is_some());
        assert!(!ds.tenants.read().await.entries.contains_key("t2"));
        assert!(ds.get_tenant("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn add_limit_updates_store_and_cache() {
        let (ds, store) = test_datastore();
        ds.add_tenant("t1").await.unwrap();
        ds.add_limit("t1", ResourceType::Vcpus, 8).await.unwrap();

        let cached = ds.get_tenant("t1").await.unwrap().unwrap();
        assert_eq!(cached.resource(ResourceType::Vcpus).unwrap().limit, Some(8));
        let stored = store.get_tenant("t1").unwrap().unwrap().tenant;
        assert_eq!(stored.resource(ResourceType::Vcpus).unwrap().limit, Some(8));

        assert!(matches!(
            ds.add_limit("ghost", ResourceType::Vcpus, 1).await,
            Err(DatastoreError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cnci_lifecycle_signals_waiter() {
        let (ds, store) = test_datastore();
        ds.add_tenant("t1").await.unwrap();
        ds.add_tenant_cnci("t1", "cnci-1", "02:aa:bb:cc:dd:ee").await.unwrap();
        let waiter = ds.register_cnci_waiter("t1").await;

        ds.add_cnci_ip("02:aa:bb:cc:dd:ee", "192.168.1.10").await.unwrap();
        assert!(waiter.wait().await.unwrap());

        let stored = store.get_tenant("t1").unwrap().unwrap().tenant;
        assert_eq!(stored.cnci_id.as_deref(), Some("cnci-1"));
        assert_eq!(stored.cnci_ip.as_deref(), Some("192.168.1.10"));

        ds.remove_tenant_cnci("t1").await.unwrap();
        let cached = ds.get_tenant("t1").await.unwrap().unwrap();
        assert!(cached.cnci_id.is_none() && cached.cnci_ip.is_none());

        assert!(matches!(
            ds.add_cnci_ip("02:00:00:00:00:00", "1.2.3.4").await,
            Err(DatastoreError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cnci_summary_lists_subnets() {
        let (ds, _store) = test_datastore();
        ds.add_tenant("t1").await.unwrap();
        ds.add_tenant("t2").await.unwrap();
        ds.add_tenant_cnci("t1", "cnci-1", "02:aa:bb:cc:dd:01").await.unwrap();
        ds.allocate_tenant_ip("t1").await.unwrap();
        ds.allocate_tenant_ip("t2").await.unwrap();

        let all = ds.get_tenant_cnci_summary(None).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].subnets, vec!["172.16.0.0/24".to_string()]);
        assert_eq!(all[1].subnets, vec!["172.16.1.0/24".to_string()]);

        let one = ds.get_tenant_cnci_summary(Some("cnci-1")).await;
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].tenant_id, "t1");
        assert!(ds.get_tenant_cnci_summary(Some("nope")).await.is_empty());
    }

    // ── Tenant network ─────────────────────────────────────────────

    #[tokio::test]
    async fn allocate_and_release_persist_claims() {
        let (ds, store) = test_datastore();
        ds.add_tenant("t1").await.unwrap();
        ds.add_tenant("t2").await.unwrap();

        let a = ds.allocate_tenant_ip("t1").await.unwrap();
        let b = ds.allocate_tenant_ip("t2").await.unwrap();
        assert_eq!(a.to_string(), "172.16.0.2");
        assert_eq!(b.to_string(), "172.16.1.2");
        assert!(store.get_tenant("t1").unwrap().unwrap().network[&0x1000].contains(&2));

        ds.release_tenant_ip("t1", "172.16.0.2").await.unwrap();
        ds.release_tenant_ip("t1", "172.16.0.2").await.unwrap();
        assert!(store.get_tenant("t1").unwrap().unwrap().network.is_empty());

        assert!(matches!(
            ds.release_tenant_ip("t1", "bogus").await,
            Err(DatastoreError::InvalidAddress(_))
        ));
        assert!(matches!(
            ds.allocate_tenant_ip("ghost").await,
            Err(DatastoreError::TenantNotFound(_))
        ));
    }

    // ── Instances ──────────────────────────────────────────────────

    #[tokio::test]
    async fn add_then_delete_instance_restores_counters() {
        let (ds, store) = test_datastore();
        ds.add_tenant("t1").await.unwrap();
        let before = ds.get_tenant("t1").await.unwrap().unwrap();

        let mut instance = new_instance(&ds, "i-1", "t1").await;
        instance.node_id = Some("node-a".to_string());
        ds.add_instance(instance.clone()).await.unwrap();

        let during = ds.get_tenant("t1").await.unwrap().unwrap();
        assert_eq!(usage_of(&during, ResourceType::Instances), 1);
        assert_eq!(usage_of(&during, ResourceType::Vcpus), 2);
        assert_eq!(usage_of(&during, ResourceType::MemMb), 512);
        assert_eq!(ds.get_instance("i-1").await.unwrap(), instance);
        assert_eq!(ds.get_all_instances_from_tenant("t1").await.unwrap().len(), 1);
        assert_eq!(ds.get_all_instances_by_node("node-a").await.len(), 1);
        assert_eq!(store.list_instances().unwrap().len(), 1);

        ds.delete_instance("i-1").await.unwrap();

        let after = ds.get_tenant("t1").await.unwrap().unwrap();
        assert_eq!(after.resources, before.resources);
        assert!(ds.get_all_instances().await.is_empty());
        assert!(ds.get_all_instances_from_tenant("t1").await.unwrap().is_empty());
        assert!(ds.get_all_instances_by_node("node-a").await.is_empty());
        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.get_tenant("t1").unwrap().unwrap().network.is_empty());

        let log = ds.get_event_log().await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].tenant_id, "t1");
        assert_eq!(log[0].message, "Deleted Instance i-1");

        // The address is free again.
        assert_eq!(ds.allocate_tenant_ip("t1").await.unwrap().to_string(), "172.16.0.2");
    }

    #[tokio::test]
    async fn delete_unknown_instance_fails() {
        let (ds, _store) = test_datastore();
        assert!(matches!(
            ds.delete_instance("nope").await,
            Err(DatastoreError::InstanceNotFound(_))
        ));
        assert!(matches!(
            ds.get_instance("nope").await,
            Err(DatastoreError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_node_forgets_membership() {
        let (ds, _store) = test_datastore();
        ds.add_tenant("t1").await.unwrap();
        let mut instance = new_instance(&ds, "i-1", "t1").await;
        instance.node_id = Some("node-a".to_string());
        ds.add_instance(instance).await.unwrap();

        ds.delete_node("node-a").await;
        assert!(ds.get_all_instances_by_node("node-a").await.is_empty());
        assert!(ds.get_instance("i-1").await.is_ok());
    }

    // ── Workloads and events ───────────────────────────────────────

    #[tokio::test]
    async fn workload_lookups() {
        let (ds, store) = test_datastore();
        assert_eq!(ds.get_cnci_workload_id().await.unwrap(), "wl-cnci");
        assert_eq!(ds.get_workloads().await.unwrap().len(), 2);

        store.put_workload(&test_workload("wl-late", false)).unwrap();
        assert_eq!(ds.get_workload("wl-late").await.unwrap().id, "wl-late");
        assert!(matches!(
            ds.get_workload("missing").await,
            Err(DatastoreError::WorkloadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn no_cnci_workload_is_an_error() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let ds = Datastore::init(store, DatastoreConfig::inline());
        assert!(matches!(
            ds.get_cnci_workload_id().await,
            Err(DatastoreError::NoCnciWorkload)
        ));
    }

    #[tokio::test]
    async fn clear_log_empties_event_log() {
        let (ds, _store) = test_datastore();
        ds.log_event("t1", EventLevel::Warn, "something odd");
        assert_eq!(ds.get_event_log().await.unwrap().len(), 1);
        ds.clear_log().await.unwrap();
        assert!(ds.get_event_log().await.unwrap().is_empty());
    }

    // ── Warm-up and shutdown ───────────────────────────────────────

    #[tokio::test]
    async fn init_rebuilds_indices_from_store() {
        let (ds, store) = test_datastore();
        ds.add_tenant("t1").await.unwrap();
        let mut instance = new_instance(&ds, "i-1", "t1").await;
        instance.node_id = Some("node-a".to_string());
        ds.add_instance(instance).await.unwrap();
        ds.flush().await;

        // A second cache warmed from the same store sees the same state.
        let warm = Datastore::init(store.clone(), DatastoreConfig::inline());
        let tenant = warm.get_tenant("t1").await.unwrap().unwrap();
        assert_eq!(usage_of(&tenant, ResourceType::Instances), 1);
        assert_eq!(usage_of(&tenant, ResourceType::Vcpus), 2);
        assert_eq!(warm.get_all_instances_from_tenant("t1").await.unwrap().len(), 1);
        assert_eq!(warm.get_all_instances_by_node("node-a").await.len(), 1);
        assert_eq!(warm.get_cnci_workload_id().await.unwrap(), "wl-cnci");
        // Claimed addresses survive, so the next one moves on.
        assert_eq!(warm.allocate_tenant_ip("t1").await.unwrap().to_string(), "172.16.0.3");
    }

    #[tokio::test]
    async fn exit_disconnects_store() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let ds = Datastore::init(store.clone(), DatastoreConfig::default());
        ds.add_tenant("t1").await.unwrap();
        ds.exit().await;

        assert!(matches!(store.list_tenants(), Err(StateError::Closed)));
        assert!(matches!(
            ds.get_event_log().await,
            Err(DatastoreError::State(StateError::Closed))
        ));
    }
}
