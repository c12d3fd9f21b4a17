//! CSI Node service trait.
//!
//! The Node service makes provisioned volumes available to workloads:
//!
//! 1. **Publish** — bind-mount the volume directory at the workload's
//!    target path.
//! 2. **Unpublish** — remove the bind mount and its mount point.
//!
//! It also reports node identity, topology, and per-volume usage.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeGetVolumeStatsRequest, NodeInfo, NodePublishVolumeRequest, VolumeUsage,
};

/// Node service — local mount / unmount operations and node facts.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Publish a volume: bind-mount its directory at the target path.
    ///
    /// This is idempotent — calling it again for the same `target_path`
    /// should succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind mount and remove the target
    /// path.
    async fn unpublish_volume(&self, target_path: &str) -> Result<(), CsiError>;

    /// Return usage statistics for a published volume, in bytes and inodes.
    async fn volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<Vec<VolumeUsage>, CsiError>;

    /// Return information about the node this service runs on.
    async fn node_info(&self) -> Result<NodeInfo, CsiError>;

    /// Advertise the capabilities of the Node service.
    async fn node_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;
}
