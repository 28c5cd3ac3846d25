//! StateStore: redb-backed persistence for the Cirrus datastore.
//!
//! Implements [`PersistentStore`] over the tables in [`crate::tables`]. All
//! values are JSON-serialized into redb's `&[u8]` value columns; claimed
//! tenant addresses are stored as empty values under composite keys. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::persistent::PersistentStore;
use crate::tables::*;
use crate::types::*;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Row stored per reported instance stat.
#[derive(Debug, Serialize, Deserialize)]
struct InstanceStatRow {
    node_id: NodeId,
    timestamp: DateTime<Utc>,
    stat: InstanceStat,
}

/// Thread-safe persistent store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    closed: Arc<AtomicBool>,
    /// Disambiguates append-only keys written within the same nanosecond.
    seq: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            closed: Arc::new(AtomicBool::new(false)),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [
            TENANTS,
            TENANT_IPS,
            INSTANCES,
            WORKLOADS,
            NODE_STATS,
            INSTANCE_STATS,
            FRAME_STATS,
            EVENTS,
            BLOCK_DATA,
            ATTACHMENTS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn check_open(&self) -> StateResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StateError::Closed);
        }
        Ok(())
    }

    /// `{timestamp_nanos:020}:{seq:020}` suffix for append-only keys.
    fn append_suffix(&self, at: DateTime<Utc>) -> String {
        let nanos = at.timestamp_nanos_opt().unwrap_or_default().max(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{nanos:020}:{seq:020}")
    }

    // ── Generic table helpers ──────────────────────────────────────

    fn put<T: Serialize>(&self, def: Table, key: &str, value: &T) -> StateResult<()> {
        self.check_open()?;
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, def: Table, key: &str) -> StateResult<Option<T>> {
        self.check_open()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let value = match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
            None => None,
        };
        Ok(value)
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, def: Table, prefix: &str) -> StateResult<Vec<(String, T)>> {
        self.check_open()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push((key.value().to_string(), item));
            }
        }
        Ok(results)
    }

    fn scan_keys(&self, def: Table, prefix: &str) -> StateResult<Vec<String>> {
        self.check_open()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                keys.push(key.value().to_string());
            }
        }
        Ok(keys)
    }

    /// Remove a key. Returns true if it existed.
    fn remove(&self, def: Table, key: &str) -> StateResult<bool> {
        self.check_open()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Remove every key starting with `prefix`. Returns the number removed.
    fn remove_prefix(&self, def: Table, prefix: &str) -> StateResult<usize> {
        // Collect keys in a read transaction first.
        let keys = self.scan_keys(def, prefix)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(keys.len())
    }

    fn values<T: DeserializeOwned>(&self, def: Table) -> StateResult<Vec<T>> {
        Ok(self.scan(def, "")?.into_iter().map(|(_, v)| v).collect())
    }

    /// Claimed hosts per tenant, read from the `tenant_ips` table.
    fn tenant_claims(&self, prefix: &str) -> StateResult<HashMap<String, BTreeMap<u16, BTreeSet<u8>>>> {
        let mut claims: HashMap<String, BTreeMap<u16, BTreeSet<u8>>> = HashMap::new();
        for key in self.scan_keys(TENANT_IPS, prefix)? {
            let Some((tenant_id, subnet, host)) = parse_claim_key(&key) else {
                debug!(%key, "skipping malformed tenant ip key");
                continue;
            };
            claims
                .entry(tenant_id.to_string())
                .or_default()
                .entry(subnet)
                .or_default()
                .insert(host);
        }
        Ok(claims)
    }
}

fn claim_key(tenant_id: &str, subnet: u16, host: u8) -> String {
    format!("{tenant_id}:{subnet:05}:{host:03}")
}

fn parse_claim_key(key: &str) -> Option<(&str, u16, u8)> {
    let mut parts = key.rsplitn(3, ':');
    let host = parts.next()?.parse().ok()?;
    let subnet = parts.next()?.parse().ok()?;
    let tenant_id = parts.next()?;
    Some((tenant_id, subnet, host))
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or_default() as f64 / 1000.0
}

impl PersistentStore for StateStore {
    fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("state store disconnected");
        }
    }

    // ── Event log ──────────────────────────────────────────────────

    fn log_event(&self, tenant_id: &str, level: EventLevel, message: &str) -> StateResult<()> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            tenant_id: tenant_id.to_string(),
            level,
            message: message.to_string(),
        };
        let key = self.append_suffix(entry.timestamp);
        self.put(EVENTS, &key, &entry)
    }

    fn clear_log(&self) -> StateResult<()> {
        let removed = self.remove_prefix(EVENTS, "")?;
        debug!(removed, "event log cleared");
        Ok(())
    }

    fn event_log(&self) -> StateResult<Vec<LogEntry>> {
        self.values(EVENTS)
    }

    // ── Workloads ──────────────────────────────────────────────────

    fn cnci_workload_id(&self) -> StateResult<Option<String>> {
        let workloads: Vec<Workload> = self.values(WORKLOADS)?;
        Ok(workloads.into_iter().find(|w| w.cnci).map(|w| w.id))
    }

    fn get_workload(&self, id: &str) -> StateResult<Option<Workload>> {
        self.get(WORKLOADS, id)
    }

    fn list_workloads(&self) -> StateResult<Vec<Workload>> {
        self.values(WORKLOADS)
    }

    fn put_workload(&self, workload: &Workload) -> StateResult<()> {
        self.put(WORKLOADS, &workload.id, workload)?;
        debug!(workload_id = %workload.id, "workload stored");
        Ok(())
    }

    fn workload_storage(&self, id: &str) -> StateResult<Option<StorageResource>> {
        let workload: Workload = self
            .get(WORKLOADS, id)?
            .ok_or_else(|| StateError::NotFound(format!("workload {id}")))?;
        Ok(workload.storage)
    }

    // ── Tenants ────────────────────────────────────────────────────

    fn add_tenant(&self, id: &str, cnci_mac: &str) -> StateResult<()> {
        self.check_open()?;
        let value =
            serde_json::to_vec(&Tenant::new(id, cnci_mac)).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(TENANTS).map_err(map_err!(Table))?;
            let exists = table.get(id).map_err(map_err!(Read))?.is_some();
            if !exists {
                table
                    .insert(id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            inserted = !exists;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(tenant_id = %id, inserted, "tenant stored");
        Ok(())
    }

    fn add_limit(&self, tenant_id: &str, rtype: ResourceType, limit: i64) -> StateResult<()> {
        let mut tenant: Tenant = self
            .get(TENANTS, tenant_id)?
            .ok_or_else(|| StateError::NotFound(format!("tenant {tenant_id}")))?;
        match tenant.resource_mut(rtype) {
            Some(resource) => resource.limit = Some(limit),
            None => tenant.resources.push(Resource {
                rtype,
                limit: Some(limit),
                usage: 0,
            }),
        }
        self.put(TENANTS, tenant_id, &tenant)
    }

    fn get_tenant(&self, id: &str) -> StateResult<Option<TenantRecord>> {
        let Some(tenant) = self.get::<Tenant>(TENANTS, id)? else {
            return Ok(None);
        };
        let mut claims = self.tenant_claims(&format!("{id}:"))?;
        Ok(Some(TenantRecord {
            network: claims.remove(id).unwrap_or_default(),
            tenant,
        }))
    }

    fn list_tenants(&self) -> StateResult<Vec<TenantRecord>> {
        let tenants: Vec<Tenant> = self.values(TENANTS)?;
        let mut claims = self.tenant_claims("")?;
        Ok(tenants
            .into_iter()
            .map(|tenant| TenantRecord {
                network: claims.remove(&tenant.id).unwrap_or_default(),
                tenant,
            })
            .collect())
    }

    fn update_tenant(&self, tenant: &Tenant) -> StateResult<()> {
        self.put(TENANTS, &tenant.id, tenant)
    }

    fn claim_tenant_ip(&self, tenant_id: &str, subnet: u16, host: u8) -> StateResult<()> {
        self.check_open()?;
        let key = claim_key(tenant_id, subnet, host);
        let empty: &[u8] = &[];
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TENANT_IPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), empty)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn release_tenant_ip(&self, tenant_id: &str, subnet: u16, host: u8) -> StateResult<()> {
        self.remove(TENANT_IPS, &claim_key(tenant_id, subnet, host))?;
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    fn list_instances(&self) -> StateResult<Vec<Instance>> {
        self.values(INSTANCES)
    }

    fn add_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put(INSTANCES, &instance.id, instance)
    }

    fn remove_instance(&self, id: &str) -> StateResult<()> {
        let existed = self.remove(INSTANCES, id)?;
        debug!(instance_id = %id, existed, "instance removed");
        Ok(())
    }

    // ── Statistics ─────────────────────────────────────────────────

    fn add_node_stat(&self, stat: &NodeStat) -> StateResult<()> {
        let key = format!("{}:{}", stat.node_id, self.append_suffix(Utc::now()));
        self.put(NODE_STATS, &key, stat)
    }

    fn node_summary(&self) -> StateResult<Vec<NodeSummary>> {
        let live: BTreeSet<String> = self.scan_keys(INSTANCES, "")?.into_iter().collect();

        // Keys sort by instance then time, so the last row per instance wins.
        let mut latest: HashMap<String, InstanceStatRow> = HashMap::new();
        for (_, row) in self.scan::<InstanceStatRow>(INSTANCE_STATS, "")? {
            if live.contains(&row.stat.instance_id) {
                latest.insert(row.stat.instance_id.clone(), row);
            }
        }

        let mut summaries: BTreeMap<String, NodeSummary> = BTreeMap::new();
        for row in latest.into_values() {
            let summary = summaries
                .entry(row.node_id.clone())
                .or_insert_with(|| NodeSummary {
                    node_id: row.node_id.clone(),
                    ..Default::default()
                });
            summary.total_instances += 1;
            match row.stat.state {
                InstanceStatus::Running => summary.total_running += 1,
                InstanceStatus::Pending => summary.total_pending += 1,
                InstanceStatus::Exited => summary.total_exited += 1,
                InstanceStatus::Stopping | InstanceStatus::Missing => {}
            }
        }
        Ok(summaries.into_values().collect())
    }

    fn add_instance_stats(&self, stats: &[InstanceStat], node_id: &str) -> StateResult<()> {
        if stats.is_empty() {
            return Ok(());
        }
        self.check_open()?;
        let now = Utc::now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCE_STATS).map_err(map_err!(Table))?;
            for stat in stats {
                let row = InstanceStatRow {
                    node_id: node_id.to_string(),
                    timestamp: now,
                    stat: stat.clone(),
                };
                let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
                let key = format!("{}:{}", stat.instance_id, self.append_suffix(now));
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn add_frame_stat(&self, frame: &FrameTrace) -> StateResult<()> {
        let key = format!("{}:{}", frame.label, self.append_suffix(Utc::now()));
        self.put(FRAME_STATS, &key, frame)
    }

    fn batch_frame_summary(&self) -> StateResult<Vec<BatchFrameSummary>> {
        let mut by_label: BTreeMap<String, (u64, f64)> = BTreeMap::new();
        for frame in self.values::<FrameTrace>(FRAME_STATS)? {
            let entry = by_label.entry(frame.label.clone()).or_default();
            entry.0 += 1;
            entry.1 += elapsed_ms(frame.start_timestamp, frame.end_timestamp);
        }
        Ok(by_label
            .into_iter()
            .map(|(label, (frames, total))| BatchFrameSummary {
                label,
                frames,
                average_elapsed_ms: total / frames as f64,
            })
            .collect())
    }

    fn batch_frame_statistics(&self, label: &str) -> StateResult<Vec<BatchFrameStat>> {
        let mut by_node: BTreeMap<String, (u64, f64)> = BTreeMap::new();
        for (_, frame) in self.scan::<FrameTrace>(FRAME_STATS, &format!("{label}:"))? {
            // Prefix scans also match labels that merely start with `label:`.
            if frame.label != label {
                continue;
            }
            for node in &frame.nodes {
                let entry = by_node.entry(node.node_id.clone()).or_default();
                entry.0 += 1;
                entry.1 += elapsed_ms(node.rx_timestamp, node.tx_timestamp);
            }
        }
        Ok(by_node
            .into_iter()
            .map(|(node_id, (frames, total))| BatchFrameStat {
                node_id,
                frames,
                total_elapsed_ms: total,
                average_elapsed_ms: total / frames as f64,
            })
            .collect())
    }

    // ── Block storage ──────────────────────────────────────────────

    fn list_block_data(&self) -> StateResult<HashMap<String, BlockData>> {
        Ok(self
            .values::<BlockData>(BLOCK_DATA)?
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect())
    }

    fn create_block_data(&self, data: &BlockData) -> StateResult<()> {
        self.put(BLOCK_DATA, &data.id, data)?;
        debug!(block_id = %data.id, "block device stored");
        Ok(())
    }

    fn update_block_data(&self, data: &BlockData) -> StateResult<()> {
        if self.get::<BlockData>(BLOCK_DATA, &data.id)?.is_none() {
            return Err(StateError::NotFound(format!("block device {}", data.id)));
        }
        self.put(BLOCK_DATA, &data.id, data)
    }

    fn delete_block_data(&self, id: &str) -> StateResult<()> {
        self.remove(BLOCK_DATA, id)?;
        Ok(())
    }

    fn tenant_devices(&self, tenant_id: &str) -> StateResult<HashMap<String, BlockData>> {
        let mut devices = self.list_block_data()?;
        devices.retain(|_, d| d.tenant_id == tenant_id);
        Ok(devices)
    }

    fn create_storage_attachment(&self, attachment: &StorageAttachment) -> StateResult<()> {
        self.put(ATTACHMENTS, &attachment.id, attachment)
    }

    fn list_storage_attachments(&self) -> StateResult<HashMap<String, StorageAttachment>> {
        Ok(self
            .values::<StorageAttachment>(ATTACHMENTS)?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect())
    }

    fn delete_storage_attachment(&self, id: &str) -> StateResult<()> {
        self.remove(ATTACHMENTS, id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn test_instance(id: &str, tenant_id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            workload_id: "wl-1".to_string(),
            node_id: None,
            state: InstanceStatus::Pending,
            ip_address: "172.16.0.2".to_string(),
            mac_address: "02:00:ac:10:00:02".to_string(),
            usage: BTreeMap::from([(ResourceType::Vcpus, 2), (ResourceType::MemMb, 512)]),
            ssh: None,
            cnci: false,
        }
    }

    fn test_workload(id: &str, cnci: bool) -> Workload {
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
            storage: Some(StorageResource {
                source_id: Some("img-1".to_string()),
                size_gb: 10,
                bootable: true,
                ephemeral: false,
            }),
            cnci,
        }
    }

    fn test_block(id: &str, tenant_id: &str) -> BlockData {
        BlockData {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            size_gb: 20,
            state: BlockState::Available,
            create_time: Utc::now(),
        }
    }

    fn instance_stat(id: &str, state: InstanceStatus) -> InstanceStat {
        InstanceStat {
            instance_id: id.to_string(),
            state,
            ..Default::default()
        }
    }

    // ── Tenants ────────────────────────────────────────────────────

    #[test]
    fn tenant_add_and_get() {
        let store = test_store();
        store.add_tenant("t1", "02:11:22:33:44:55").unwrap();

        let record = store.get_tenant("t1").unwrap().unwrap();
        assert_eq!(record.tenant.id, "t1");
        assert_eq!(record.tenant.cnci_mac, "02:11:22:33:44:55");
        assert_eq!(record.tenant.resources.len(), ResourceType::ALL.len());
        assert!(record.network.is_empty());
    }

    #[test]
    fn tenant_add_twice_keeps_first_mac() {
        let store = test_store();
        store.add_tenant("t1", "02:11:22:33:44:55").unwrap();
        store.add_tenant("t1", "02:66:77:88:99:aa").unwrap();

        let record = store.get_tenant("t1").unwrap().unwrap();
        assert_eq!(record.tenant.cnci_mac, "02:11:22:33:44:55");
    }

    #[test]
    fn tenant_get_nonexistent_returns_none() {
        let store = test_store();
        assert!(store.get_tenant("nope").unwrap().is_none());
    }

    #[test]
    fn tenant_limit_updates_resource() {
        let store = test_store();
        store.add_tenant("t1", "02:11:22:33:44:55").unwrap();
        store.add_limit("t1", ResourceType::Vcpus, 16).unwrap();

        let record = store.get_tenant("t1").unwrap().unwrap();
        let vcpus = record.tenant.resource(ResourceType::Vcpus).unwrap();
        assert_eq!(vcpus.limit, Some(16));
    }

    #[test]
    fn tenant_limit_unknown_tenant_is_not_found() {
        let store = test_store();
        let err = store.add_limit("ghost", ResourceType::Vcpus, 1).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn tenant_ip_claims_round_trip() {
        let store = test_store();
        store.add_tenant("t1", "02:11:22:33:44:55").unwrap();
        store.add_tenant("t2", "02:11:22:33:44:56").unwrap();
        store.claim_tenant_ip("t1", 0x1000, 2).unwrap();
        store.claim_tenant_ip("t1", 0x1000, 3).unwrap();
        store.claim_tenant_ip("t2", 0x1001, 2).unwrap();
        store.release_tenant_ip("t1", 0x1000, 2).unwrap();

        let t1 = store.get_tenant("t1").unwrap().unwrap();
        assert_eq!(t1.network.get(&0x1000), Some(&BTreeSet::from([3])));

        let all = store.list_tenants().unwrap();
        assert_eq!(all.len(), 2);
        let t2 = all.iter().find(|r| r.tenant.id == "t2").unwrap();
        assert_eq!(t2.network.get(&0x1001), Some(&BTreeSet::from([2])));
    }

    #[test]
    fn tenant_update_stores_cnci() {
        let store = test_store();
        store.add_tenant("t1", "02:11:22:33:44:55").unwrap();
        let mut tenant = store.get_tenant("t1").unwrap().unwrap().tenant;
        tenant.cnci_id = Some("cnci-1".to_string());
        tenant.cnci_ip = Some("192.168.0.1".to_string());
        store.update_tenant(&tenant).unwrap();

        let stored = store.get_tenant("t1").unwrap().unwrap().tenant;
        assert_eq!(stored, tenant);
    }

    // ── Instances ──────────────────────────────────────────────────

    #[test]
    fn instance_add_list_remove() {
        let store = test_store();
        store.add_instance(&test_instance("i-1", "t1")).unwrap();
        store.add_instance(&test_instance("i-2", "t1")).unwrap();
        assert_eq!(store.list_instances().unwrap().len(), 2);

        store.remove_instance("i-1").unwrap();
        let left = store.list_instances().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0], test_instance("i-2", "t1"));

        // Removing twice is harmless.
        store.remove_instance("i-1").unwrap();
    }

    // ── Workloads ──────────────────────────────────────────────────

    #[test]
    fn workload_lookup_and_cnci() {
        let store = test_store();
        store.put_workload(&test_workload("wl-1", false)).unwrap();
        assert!(store.cnci_workload_id().unwrap().is_none());

        store.put_workload(&test_workload("wl-cnci", true)).unwrap();
        assert_eq!(store.cnci_workload_id().unwrap().as_deref(), Some("wl-cnci"));
        assert_eq!(store.list_workloads().unwrap().len(), 2);
        assert_eq!(
            store.get_workload("wl-1").unwrap(),
            Some(test_workload("wl-1", false))
        );

        let storage = store.workload_storage("wl-1").unwrap().unwrap();
        assert_eq!(storage.size_gb, 10);
        assert!(matches!(
            store.workload_storage("missing"),
            Err(StateError::NotFound(_))
        ));
    }

    // ── Statistics ─────────────────────────────────────────────────

    #[test]
    fn node_summary_uses_latest_stat_of_live_instances() {
        let store = test_store();
        store.add_instance(&test_instance("i-1", "t1")).unwrap();
        store.add_instance(&test_instance("i-2", "t1")).unwrap();

        store
            .add_instance_stats(&[instance_stat("i-1", InstanceStatus::Pending)], "node-a")
            .unwrap();
        store
            .add_instance_stats(
                &[
                    instance_stat("i-1", InstanceStatus::Running),
                    instance_stat("i-2", InstanceStatus::Exited),
                    instance_stat("gone", InstanceStatus::Running),
                ],
                "node-a",
            )
            .unwrap();

        let summary = store.node_summary().unwrap();
        assert_eq!(
            summary,
            vec![NodeSummary {
                node_id: "node-a".to_string(),
                total_instances: 2,
                total_running: 1,
                total_pending: 0,
                total_exited: 1,
            }]
        );
    }

    #[test]
    fn frame_summary_and_statistics() {
        let store = test_store();
        let start = Utc::now();
        for label in ["batch-1", "batch-1", "batch-2"] {
            store
                .add_frame_stat(&FrameTrace {
                    label: label.to_string(),
                    frame_type: "command".to_string(),
                    operand: "START".to_string(),
                    start_timestamp: start,
                    end_timestamp: start + Duration::milliseconds(40),
                    nodes: vec![NodeTrace {
                        node_id: "node-a".to_string(),
                        rx_timestamp: start,
                        tx_timestamp: start + Duration::milliseconds(10),
                    }],
                })
                .unwrap();
        }

        let summary = store.batch_frame_summary().unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].label, "batch-1");
        assert_eq!(summary[0].frames, 2);
        assert_eq!(summary[0].average_elapsed_ms, 40.0);

        let stats = store.batch_frame_statistics("batch-1").unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].frames, 2);
        assert_eq!(stats[0].total_elapsed_ms, 20.0);
        assert_eq!(stats[0].average_elapsed_ms, 10.0);

        assert!(store.batch_frame_statistics("batch").unwrap().is_empty());
    }

    #[test]
    fn node_stats_append() {
        let store = test_store();
        let stat = NodeStat {
            node_id: "node-a".to_string(),
            hostname: "compute-1".to_string(),
            load: 3,
            ..Default::default()
        };
        store.add_node_stat(&stat).unwrap();
        store.add_node_stat(&stat).unwrap();
        assert_eq!(store.scan_keys(NODE_STATS, "node-a:").unwrap().len(), 2);
    }

    // ── Event log ──────────────────────────────────────────────────

    #[test]
    fn event_log_append_read_clear() {
        let store = test_store();
        store.log_event("t1", EventLevel::Info, "first").unwrap();
        store.log_event("t1", EventLevel::Error, "second").unwrap();

        let log = store.event_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "first");
        assert_eq!(log[1].level, EventLevel::Error);

        store.clear_log().unwrap();
        assert!(store.event_log().unwrap().is_empty());
    }

    // ── Block storage ──────────────────────────────────────────────

    #[test]
    fn block_data_crud() {
        let store = test_store();
        store.create_block_data(&test_block("vol-1", "t1")).unwrap();
        store.create_block_data(&test_block("vol-2", "t2")).unwrap();

        let mut updated = test_block("vol-1", "t1");
        updated.state = BlockState::InUse;
        store.update_block_data(&updated).unwrap();

        let all = store.list_block_data().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["vol-1"].state, BlockState::InUse);
        assert_eq!(store.tenant_devices("t1").unwrap().len(), 1);

        store.delete_block_data("vol-1").unwrap();
        assert!(matches!(
            store.update_block_data(&updated),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn storage_attachment_crud() {
        let store = test_store();
        let attachment = StorageAttachment {
            id: "a-1".to_string(),
            instance_id: "i-1".to_string(),
            block_id: "vol-1".to_string(),
        };
        store.create_storage_attachment(&attachment).unwrap();
        assert_eq!(store.list_storage_attachments().unwrap()["a-1"], attachment);

        store.delete_storage_attachment("a-1").unwrap();
        assert!(store.list_storage_attachments().unwrap().is_empty());
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    #[test]
    fn disconnect_rejects_further_calls() {
        let store = test_store();
        store.disconnect();
        assert!(matches!(store.list_instances(), Err(StateError::Closed)));
        assert!(matches!(
            store.log_event("t1", EventLevel::Info, "late"),
            Err(StateError::Closed)
        ));
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.add_tenant("t1", "02:11:22:33:44:55").unwrap();
            store.claim_tenant_ip("t1", 0x1000, 2).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let record = store.get_tenant("t1").unwrap().unwrap();
        assert!(record.network[&0x1000].contains(&2));
    }

    #[test]
    fn claim_key_parsing() {
        assert_eq!(parse_claim_key(&claim_key("t1", 4096, 2)), Some(("t1", 4096, 2)));
        assert_eq!(
            parse_claim_key(&claim_key("a:b", 8191, 254)),
            Some(("a:b", 8191, 254))
        );
        assert_eq!(parse_claim_key("garbage"), None);
    }
}
