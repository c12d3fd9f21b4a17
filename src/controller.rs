//! CSI Controller service trait.
//!
//! The Controller service manages the volume lifecycle on this node:
//! creation, deletion, capability validation, and capacity queries.  It is
//! invoked by the orchestrator's provisioning controllers.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, CreateVolumeRequest, ValidateVolumeCapabilitiesRequest,
    ValidatedCapabilities, Volume, VolumeId,
};

/// Controller service — volume lifecycle management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume.
    ///
    /// Creation is idempotent by name: repeating a request with the same
    /// name and size returns the already-provisioned volume.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.
    ///
    /// Unknown ids are treated as success so that retried deletions
    /// converge.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Check that the volume exists and supports the given capabilities.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidatedCapabilities, CsiError>;

    /// Return the capacity in bytes still allocatable on this node.
    async fn get_capacity(&self) -> Result<i64, CsiError>;

    /// Advertise the capabilities of the Controller service.
    async fn controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
