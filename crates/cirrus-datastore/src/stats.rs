//! Telemetry ingestion and the views built from it.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cirrus_state::*;

use crate::datastore::{Datastore, NodeEntry};
use crate::error::DatastoreResult;
use crate::persist::PersistOp;
use crate::usage::UsageDelta;

/// Negative raw counters mean "unknown" and count as zero.
fn reduce_to_zero(value: i64) -> i64 {
    value.max(0)
}

impl Datastore {
    /// Ingest a periodic node report.
    pub async fn handle_stats(&self, stat: NodeStat) -> DatastoreResult<()> {
        if stat.load != NodeStat::LOAD_UNAVAILABLE {
            self.add_node_stat(&stat).await;
        }
        self.add_instance_stats(&stat.instances, &stat.node_id).await;
        Ok(())
    }

    /// Store every traced frame. Failed frames are logged and skipped.
    pub async fn handle_trace_report(&self, trace: Trace) -> DatastoreResult<()> {
        for frame in &trace.frames {
            if let Err(e) = self.store.add_frame_stat(frame) {
                warn!(label = %frame.label, error = %e, "failed to store trace frame");
            }
        }
        debug!(frames = trace.frames.len(), "trace report handled");
        Ok(())
    }

    async fn add_node_stat(&self, stat: &NodeStat) {
        {
            let mut nodes = self.nodes.write().await;
            let entry = nodes
                .entry(stat.node_id.clone())
                .or_insert_with(|| NodeEntry::new(&stat.node_id));
            entry.node.hostname = stat.hostname.clone();
        }

        {
            let mut last_stats = self.node_last_stats.write().await;
            last_stats.insert(
                stat.node_id.clone(),
                ComputeNodeStats {
                    id: stat.node_id.clone(),
                    status: stat.status,
                    load: stat.load,
                    mem_total_mb: stat.mem_total_mb,
                    mem_available_mb: stat.mem_available_mb,
                    disk_total_mb: stat.disk_total_mb,
                    disk_available_mb: stat.disk_available_mb,
                    online_cpus: stat.cpus_online,
                },
            );
        }

        let mut row = stat.clone();
        row.instances.clear();
        self.persister.submit(PersistOp::NodeStat(row)).await;
    }

    async fn add_instance_stats(&self, stats: &[InstanceStat], node_id: &str) {
        if stats.is_empty() {
            return;
        }
        let now = Utc::now();
        for stat in stats {
            self.add_instance_stat(stat, node_id, now).await;
        }
        self.persister
            .submit(PersistOp::InstanceStats {
                node_id: node_id.to_string(),
                stats: stats.to_vec(),
            })
            .await;
    }

    async fn add_instance_stat(&self, stat: &InstanceStat, node_id: &str, now: DateTime<Utc>) {
        let instance_id = stat.instance_id.as_str();
        let current = ServerStats {
            id: stat.instance_id.clone(),
            tenant_id: String::new(),
            node_id: Some(node_id.to_string()),
            timestamp: now,
            status: stat.state,
            vcpu_usage: reduce_to_zero(stat.cpu_usage),
            mem_usage_mb: reduce_to_zero(stat.memory_usage_mb),
            disk_usage_mb: reduce_to_zero(stat.disk_usage_mb),
        };

        let (tenant_id, previous_node, delta) = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(instance_id) else {
                debug!(%instance_id, %node_id, "stats for unknown instance");
                return;
            };
            let previous_node = instance.node_id.replace(node_id.to_string());
            instance.state = stat.state;
            instance.ssh = (!stat.ssh_ip.is_empty()).then(|| SshEndpoint {
                ip: stat.ssh_ip.clone(),
                port: stat.ssh_port,
            });
            let tenant_id = instance.tenant_id.clone();

            let mut last_stats = self.instance_last_stats.write().await;
            let delta = match last_stats.get(instance_id) {
                Some(previous) => UsageDelta {
                    vcpu: current.vcpu_usage - previous.vcpu_usage,
                    memory_mb: current.mem_usage_mb - previous.mem_usage_mb,
                    disk_mb: current.disk_usage_mb - previous.disk_usage_mb,
                },
                None => UsageDelta {
                    vcpu: current.vcpu_usage,
                    memory_mb: current.mem_usage_mb,
                    disk_mb: current.disk_usage_mb,
                },
            };
            last_stats.insert(
                stat.instance_id.clone(),
                ServerStats {
                    tenant_id: tenant_id.clone(),
                    ..current
                },
            );
            (tenant_id, previous_node, delta)
        };

        if previous_node.as_deref() != Some(node_id) {
            let mut nodes = self.nodes.write().await;
            if let Some(previous) = previous_node.as_ref().and_then(|id| nodes.get_mut(id)) {
                previous.instances.remove(instance_id);
            }
            nodes
                .entry(node_id.to_string())
                .or_insert_with(|| NodeEntry::new(node_id))
                .instances
                .insert(stat.instance_id.clone());
        }

        self.update_storage_attachments(instance_id, &stat.volumes).await;

        if !delta.is_zero() && !tenant_id.is_empty() {
            let mut usage = self.tenant_usage.write().await;
            usage.entry(tenant_id).or_default().record(delta, now);
        }
    }

    /// Last known stats of the instances on `node_id`.
    pub async fn get_instance_last_stats(&self, node_id: &str) -> Vec<ServerStats> {
        let last_stats = self.instance_last_stats.read().await;
        let mut stats: Vec<ServerStats> = last_stats
            .values()
            .filter(|s| s.node_id.as_deref() == Some(node_id))
            .cloned()
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    pub async fn get_node_last_stats(&self) -> Vec<ComputeNodeStats> {
        let mut stats: Vec<ComputeNodeStats> = self.node_last_stats.read().await.values().cloned().collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    pub async fn get_node_summary(&self) -> DatastoreResult<Vec<NodeSummary>> {
        Ok(self.store.node_summary()?)
    }

    pub async fn get_batch_frame_summary(&self) -> DatastoreResult<Vec<BatchFrameSummary>> {
        Ok(self.store.batch_frame_summary()?)
    }

    pub async fn get_batch_frame_statistics(&self, label: &str) -> DatastoreResult<Vec<BatchFrameStat>> {
        Ok(self.store.batch_frame_statistics(label)?)
    }

    /// Usage samples of a tenant with `start <= timestamp <= end`.
    pub async fn get_tenant_usage(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<UsageSample> {
        self.tenant_usage
            .read()
            .await
            .get(tenant_id)
            .map(|history| history.range(start, end))
            .unwrap_or_default()
    }
}
