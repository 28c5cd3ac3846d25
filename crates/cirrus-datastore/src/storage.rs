//! Block devices, storage attachments and the attachment reconciler.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};
use uuid::Uuid;

use cirrus_state::*;

use crate::datastore::Datastore;
use crate::error::{DatastoreError, DatastoreResult};
use crate::persist::PersistOp;

/// Attachments by ID and by `(instance, volume)`.
#[derive(Debug, Default)]
pub(crate) struct AttachmentIndex {
    by_id: HashMap<String, StorageAttachment>,
    by_link: HashMap<(InstanceId, String), String>,
}

impl AttachmentIndex {
    pub(crate) fn insert(&mut self, attachment: StorageAttachment) {
        self.by_link.insert(
            (attachment.instance_id.clone(), attachment.block_id.clone()),
            attachment.id.clone(),
        );
        self.by_id.insert(attachment.id.clone(), attachment);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<StorageAttachment> {
        let attachment = self.by_id.remove(id)?;
        self.by_link
            .remove(&(attachment.instance_id.clone(), attachment.block_id.clone()));
        Some(attachment)
    }

    pub(crate) fn link(&self, instance_id: &str, block_id: &str) -> Option<&StorageAttachment> {
        self.by_link
            .get(&(instance_id.to_string(), block_id.to_string()))
            .and_then(|id| self.by_id.get(id))
    }

    pub(crate) fn for_instance<'a>(&'a self, instance_id: &'a str) -> impl Iterator<Item = &'a StorageAttachment> {
        self.by_id.values().filter(move |a| a.instance_id == instance_id)
    }

    pub(crate) fn for_volume<'a>(&'a self, block_id: &'a str) -> impl Iterator<Item = &'a StorageAttachment> {
        self.by_id.values().filter(move |a| a.block_id == block_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}

fn sorted(mut attachments: Vec<StorageAttachment>) -> Vec<StorageAttachment> {
    attachments.sort_by(|a, b| a.id.cmp(&b.id));
    attachments
}

impl Datastore {
    // ── Block devices ──────────────────────────────────────────────

    /// Create or replace a block device.
    pub async fn add_block_device(&self, device: BlockData) -> DatastoreResult<()> {
        {
            let mut tenants = self.tenants.write().await;
            match tenants.entries.get_mut(&device.tenant_id) {
                Some(entry) => {
                    entry.devices.insert(device.id.clone());
                }
                None => warn!(block_id = %device.id, tenant_id = %device.tenant_id, "block device for uncached tenant"),
            }
        }

        let existed = {
            let mut devices = self.block_devices.write().await;
            devices.insert(device.id.clone(), device.clone()).is_some()
        };

        debug!(block_id = %device.id, existed, "block device stored");
        let op = if existed {
            PersistOp::UpdateBlockData(device)
        } else {
            PersistOp::CreateBlockData(device)
        };
        self.persister.submit(op).await;
        Ok(())
    }

    pub async fn delete_block_device(&self, block_id: &str) -> DatastoreResult<()> {
        {
            let mut tenants = self.tenants.write().await;
            let mut devices = self.block_devices.write().await;
            let device = devices
                .remove(block_id)
                .ok_or_else(|| DatastoreError::BlockDeviceNotFound(block_id.to_string()))?;
            if let Some(entry) = tenants.entries.get_mut(&device.tenant_id) {
                entry.devices.remove(block_id);
            }
        }

        self.persister
            .submit(PersistOp::DeleteBlockData(block_id.to_string()))
            .await;
        info!(%block_id, "block device deleted");
        Ok(())
    }

    pub async fn get_block_device(&self, block_id: &str) -> DatastoreResult<BlockData> {
        self.block_devices
            .read()
            .await
            .get(block_id)
            .cloned()
            .ok_or_else(|| DatastoreError::BlockDeviceNotFound(block_id.to_string()))
    }

    /// Every block device owned by `tenant_id`.
    pub async fn get_block_devices(&self, tenant_id: &str) -> DatastoreResult<Vec<BlockData>> {
        let tenants = self.tenants.read().await;
        let entry = tenants
            .entries
            .get(tenant_id)
            .ok_or_else(|| DatastoreError::TenantNotFound(tenant_id.to_string()))?;
        let devices = self.block_devices.read().await;
        let mut owned: Vec<BlockData> = entry
            .devices
            .iter()
            .filter_map(|id| devices.get(id).cloned())
            .collect();
        owned.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(owned)
    }

    /// Replace an existing block device.
    pub async fn update_block_device(&self, device: BlockData) -> DatastoreResult<()> {
        if !self.block_devices.read().await.contains_key(&device.id) {
            return Err(DatastoreError::BlockDeviceNotFound(device.id));
        }
        self.add_block_device(device).await
    }

    /// Force a device into `state`. Returns false if the device is unknown.
    pub(crate) async fn set_block_state(&self, block_id: &str, state: BlockState) -> bool {
        let updated = {
            let mut devices = self.block_devices.write().await;
            devices.get_mut(block_id).map(|device| {
                device.state = state;
                device.clone()
            })
        };
        match updated {
            Some(device) => {
                self.persister.submit(PersistOp::UpdateBlockData(device)).await;
                true
            }
            None => false,
        }
    }

    // ── Attachments ────────────────────────────────────────────────

    /// Link a volume to an instance and store the link synchronously.
    pub async fn create_storage_attachment(&self, instance_id: &str, block_id: &str) -> DatastoreResult<StorageAttachment> {
        let attachment = StorageAttachment {
            id: Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            block_id: block_id.to_string(),
        };
        self.attachments.write().await.insert(attachment.clone());
        self.store.create_storage_attachment(&attachment)?;
        debug!(attachment_id = %attachment.id, %instance_id, %block_id, "storage attachment created");
        Ok(attachment)
    }

    pub async fn get_storage_attachments(&self, instance_id: &str) -> Vec<StorageAttachment> {
        let attachments = self.attachments.read().await;
        sorted(attachments.for_instance(instance_id).cloned().collect())
    }

    pub async fn get_storage_attachment(&self, instance_id: &str, block_id: &str) -> DatastoreResult<StorageAttachment> {
        self.attachments
            .read()
            .await
            .link(instance_id, block_id)
            .cloned()
            .ok_or_else(|| DatastoreError::StorageAttachmentNotFound(format!("{instance_id}/{block_id}")))
    }

    pub async fn delete_storage_attachment(&self, attachment_id: &str) -> DatastoreResult<()> {
        self.attachments
            .write()
            .await
            .remove(attachment_id)
            .ok_or_else(|| DatastoreError::StorageAttachmentNotFound(attachment_id.to_string()))?;
        self.store.delete_storage_attachment(attachment_id)?;
        debug!(%attachment_id, "storage attachment deleted");
        Ok(())
    }

    pub async fn get_volume_attachments(&self, block_id: &str) -> Vec<StorageAttachment> {
        let attachments = self.attachments.read().await;
        sorted(attachments.for_volume(block_id).cloned().collect())
    }

    /// Bring the instance's attachments in line with the volumes its node
    /// reports. New volumes are attached and marked in use; attachments
    /// whose volume is no longer reported are removed and the volume made
    /// available again.
    pub async fn update_storage_attachments(&self, instance_id: &str, volumes: &[String]) {
        let observed: HashSet<&str> = volumes.iter().map(String::as_str).collect();
        let mut ops = Vec::new();
        {
            let mut attachments = self.attachments.write().await;
            let mut devices = self.block_devices.write().await;

            for &volume in &observed {
                if attachments.link(instance_id, volume).is_some() {
                    continue;
                }
                let attachment = StorageAttachment {
                    id: Uuid::new_v4().to_string(),
                    instance_id: instance_id.to_string(),
                    block_id: volume.to_string(),
                };
                info!(%instance_id, block_id = %volume, "volume attached");
                attachments.insert(attachment.clone());
                ops.push(PersistOp::CreateAttachment(attachment));

                match devices.get_mut(volume) {
                    Some(device) => {
                        device.state = BlockState::InUse;
                        ops.push(PersistOp::UpdateBlockData(device.clone()));
                    }
                    None => warn!(%instance_id, block_id = %volume, "attached volume has no block device"),
                }
            }

            let stale: Vec<StorageAttachment> = attachments
                .for_instance(instance_id)
                .filter(|a| !observed.contains(a.block_id.as_str()))
                .cloned()
                .collect();
            for attachment in stale {
                match devices.get_mut(&attachment.block_id) {
                    Some(device) => {
                        device.state = BlockState::Available;
                        ops.push(PersistOp::UpdateBlockData(device.clone()));
                    }
                    None => warn!(%instance_id, block_id = %attachment.block_id, "detached volume has no block device"),
                }
                info!(%instance_id, block_id = %attachment.block_id, "volume detached");
                attachments.remove(&attachment.id);
                ops.push(PersistOp::DeleteAttachment(attachment.id));
            }
        }

        for op in ops {
            self.persister.submit(op).await;
        }
    }
}
