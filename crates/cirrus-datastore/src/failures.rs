//! Compensating actions for failures reported by compute nodes.

use std::fmt;

use tracing::{info, warn};

use cirrus_state::{BlockState, EventLevel};

use crate::datastore::Datastore;
use crate::error::DatastoreResult;

/// Why an instance failed to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFailureReason {
    FullCloud,
    FullComputeNode,
    NoComputeNodes,
    NoNetworkNodes,
    InvalidPayload,
    InvalidData,
    ImageFailure,
    NetworkFailure,
    LaunchFailure,
    AlreadyRunning,
    InstanceExists,
}

impl StartFailureReason {
    /// True when the instance never became real and should be deleted.
    /// The remaining reasons leave it in place for a retry.
    pub fn deletes_instance(&self) -> bool {
        match self {
            StartFailureReason::FullCloud
            | StartFailureReason::FullComputeNode
            | StartFailureReason::NoComputeNodes
            | StartFailureReason::NoNetworkNodes
            | StartFailureReason::InvalidPayload
            | StartFailureReason::InvalidData
            | StartFailureReason::ImageFailure
            | StartFailureReason::NetworkFailure => true,
            StartFailureReason::LaunchFailure
            | StartFailureReason::AlreadyRunning
            | StartFailureReason::InstanceExists => false,
        }
    }
}

impl fmt::Display for StartFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StartFailureReason::FullCloud => "Cloud is full",
            StartFailureReason::FullComputeNode => "Compute node is full",
            StartFailureReason::NoComputeNodes => "No compute node available",
            StartFailureReason::NoNetworkNodes => "No network node available",
            StartFailureReason::InvalidPayload => "YAML payload is corrupt",
            StartFailureReason::InvalidData => "Command section of YAML payload is corrupt or missing required information",
            StartFailureReason::ImageFailure => "Failed to create instance image",
            StartFailureReason::NetworkFailure => "Failed to create VNIC for instance",
            StartFailureReason::LaunchFailure => "Failed to launch instance",
            StartFailureReason::AlreadyRunning => "Instance is already running",
            StartFailureReason::InstanceExists => "Instance already exists",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartFailureReason {
    NoInstance,
    InvalidPayload,
    InvalidData,
    AlreadyRunning,
    InstanceCorrupt,
    LaunchFailure,
    NetworkFailure,
}

impl fmt::Display for RestartFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestartFailureReason::NoInstance => "Instance does not exist",
            RestartFailureReason::InvalidPayload => "YAML payload is corrupt",
            RestartFailureReason::InvalidData => "Command section of YAML payload is corrupt or missing required information",
            RestartFailureReason::AlreadyRunning => "Instance is already running",
            RestartFailureReason::InstanceCorrupt => "Instance is corrupt",
            RestartFailureReason::LaunchFailure => "Failed to launch instance",
            RestartFailureReason::NetworkFailure => "Failed to create VNIC for instance",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopFailureReason {
    NoInstance,
    InvalidPayload,
    InvalidData,
    AlreadyStopped,
}

impl fmt::Display for StopFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopFailureReason::NoInstance => "Instance does not exist",
            StopFailureReason::InvalidPayload => "YAML payload is corrupt",
            StopFailureReason::InvalidData => "Command section of YAML payload is corrupt or missing required information",
            StopFailureReason::AlreadyStopped => "Instance has already shut down",
        })
    }
}

/// Why a volume failed to attach or detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFailureReason {
    NoInstance,
    InvalidPayload,
    InvalidData,
    OperationFailure,
    StateFailure,
    InstanceFailure,
    NotSupported,
}

impl fmt::Display for VolumeFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VolumeFailureReason::NoInstance => "Instance does not exist",
            VolumeFailureReason::InvalidPayload => "YAML payload is corrupt",
            VolumeFailureReason::InvalidData => "Command section of YAML payload is corrupt or missing required information",
            VolumeFailureReason::OperationFailure => "Volume operation failed",
            VolumeFailureReason::StateFailure => "Volume is in the wrong state",
            VolumeFailureReason::InstanceFailure => "Instance failed to process the volume",
            VolumeFailureReason::NotSupported => "Volume operation not supported by instance",
        })
    }
}

impl Datastore {
    /// Clean up after an instance failed to start.
    ///
    /// A failed CNCI loses its place on the tenant and the tenant's waiter
    /// is told `false`. Other instances are deleted or kept depending on
    /// [`StartFailureReason::deletes_instance`]. An error event is logged
    /// either way.
    pub async fn start_failure(&self, instance_id: &str, reason: StartFailureReason) -> DatastoreResult<()> {
        let cnci_tenant = {
            let tenants = self.tenants.read().await;
            tenants
                .entries
                .values()
                .find(|e| e.tenant.cnci_id.as_deref() == Some(instance_id))
                .map(|e| e.tenant.id.clone())
        };

        if let Some(tenant_id) = cnci_tenant {
            warn!(%instance_id, %tenant_id, %reason, "CNCI failed to start");
            let result = self.remove_tenant_cnci(&tenant_id).await;
            self.log_event(
                &tenant_id,
                EventLevel::Error,
                &format!("CNCI Start Failure {instance_id}: {reason}"),
            );
            self.cnci_waiters.signal(&tenant_id, false).await;
            return result;
        }

        let instance = self.get_instance(instance_id).await?;
        if reason.deletes_instance() {
            self.remove_instance(instance_id).await?;
            info!(%instance_id, %reason, "instance removed after start failure");
        }
        self.log_event(
            &instance.tenant_id,
            EventLevel::Error,
            &format!("Start Failure {instance_id}: {reason}"),
        );
        Ok(())
    }

    pub async fn restart_failure(&self, instance_id: &str, reason: RestartFailureReason) -> DatastoreResult<()> {
        let instance = self.get_instance(instance_id).await?;
        self.log_event(
            &instance.tenant_id,
            EventLevel::Error,
            &format!("Restart Failure {instance_id}: {reason}"),
        );
        Ok(())
    }

    pub async fn stop_failure(&self, instance_id: &str, reason: StopFailureReason) -> DatastoreResult<()> {
        let instance = self.get_instance(instance_id).await?;
        self.log_event(
            &instance.tenant_id,
            EventLevel::Error,
            &format!("Stop Failure {instance_id}: {reason}"),
        );
        Ok(())
    }

    /// Put the volume back to `Available` and log the failure.
    pub async fn attach_volume_failure(
        &self,
        instance_id: &str,
        block_id: &str,
        reason: VolumeFailureReason,
    ) -> DatastoreResult<()> {
        if !self.set_block_state(block_id, BlockState::Available).await {
            warn!(%instance_id, %block_id, "attach failure for unknown block device");
        }
        let instance = self.get_instance(instance_id).await?;
        self.log_event(
            &instance.tenant_id,
            EventLevel::Error,
            &format!("Attach Volume Failure {block_id} to {instance_id}: {reason}"),
        );
        Ok(())
    }

    /// Put the volume back to `InUse` and log the failure. A detach is only
    /// ever issued for a volume in use.
    pub async fn detach_volume_failure(
        &self,
        instance_id: &str,
        block_id: &str,
        reason: VolumeFailureReason,
    ) -> DatastoreResult<()> {
        if !self.set_block_state(block_id, BlockState::InUse).await {
            warn!(%instance_id, %block_id, "detach failure for unknown block device");
        }
        let instance = self.get_instance(instance_id).await?;
        self.log_event(
            &instance.tenant_id,
            EventLevel::Error,
            &format!("Detach Volume Failure {block_id} from {instance_id}: {reason}"),
        );
        Ok(())
    }
}
