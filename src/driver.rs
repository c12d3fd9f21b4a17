//! The node-local CSI driver.
//!
//! [`LocalDriver`] implements the Identity, Controller and Node services on
//! top of a [`VolumeManager`].  It owns request validation, the idempotency
//! rules, and the driver-wide lock that keeps the "check free capacity, then
//! create" step atomic: node capacity is published to the orchestrator in
//! intervals and an XFS quota only binds once written, so two unserialized
//! creations could each see enough room and collectively overcommit the
//! node.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::limit::MAX_LIMITS;
use crate::node::CsiNode;
use crate::types::*;
use crate::util;
use crate::volume::{AccessType, VolumeManager};

/// The topology segment key carrying the node name.
pub const NODE_NAME_TOPOLOGY_KEY: &str = "local.csi.localvol.dev/node";

/// The three CSI services over one volumes root.
pub struct LocalDriver {
    name: String,
    version: String,
    node_name: String,
    volume_manager: Arc<VolumeManager>,
    /// Serializes the capacity recheck and creation of new volumes.
    create_lock: Mutex<()>,
}

impl LocalDriver {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        node_name: impl Into<String>,
        volume_manager: Arc<VolumeManager>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            node_name: node_name.into(),
            volume_manager,
            create_lock: Mutex::new(()),
        }
    }

    fn node_accessible_topology(&self) -> Topology {
        Topology {
            segments: HashMap::from([(
                NODE_NAME_TOPOLOGY_KEY.to_owned(),
                self.node_name.clone(),
            )]),
        }
    }

    fn volume_accessible_topology(&self) -> Vec<Topology> {
        vec![self.node_accessible_topology()]
    }

    fn validate_capabilities(&self, caps: &[VolumeCapability]) -> Result<(), CsiError> {
        if caps.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities missing in request".into(),
            ));
        }

        for cap in caps {
            if cap.access_mode != AccessMode::SingleNodeWriter {
                return Err(CsiError::InvalidArgument(format!(
                    "unsupported access mode {:?}",
                    cap.access_mode,
                )));
            }

            match &cap.access {
                VolumeAccess::Block => {
                    return Err(CsiError::InvalidArgument(
                        "only filesystem volumes are supported".into(),
                    ));
                }
                VolumeAccess::Mount { fs_type, .. } => {
                    if !self
                        .volume_manager
                        .supported_filesystems()
                        .contains(&fs_type.as_str())
                    {
                        return Err(CsiError::InvalidArgument(format!(
                            "unsupported fsType {fs_type:?}",
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    fn validate_parameters(&self, parameters: &HashMap<String, String>) -> Result<(), CsiError> {
        // No storage-class parameters are supported.
        if let Some(key) = parameters.keys().next() {
            return Err(CsiError::InvalidArgument(format!(
                "unsupported volume parameter key: {key:?}",
            )));
        }
        Ok(())
    }

    fn validate_accessibility(
        &self,
        requirements: Option<&TopologyRequirement>,
    ) -> Result<(), CsiError> {
        let Some(requirements) = requirements else {
            return Ok(());
        };
        if requirements.requisite.is_empty() {
            return Ok(());
        }

        if requirements.requisite != self.volume_accessible_topology() {
            return Err(CsiError::ResourceExhausted(
                "cannot satisfy accessibility requirements".into(),
            ));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for LocalDriver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeAccessibilityConstraints,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for LocalDriver {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        debug!("new CreateVolume request");

        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("name missing in request".into()));
        }
        self.validate_capabilities(&req.volume_capabilities)?;
        self.validate_parameters(&req.parameters)?;
        self.validate_accessibility(req.accessibility_requirements.as_ref())?;

        // All capabilities passed validation, so the request is for a
        // mounted filesystem.
        let requested_fs = req
            .volume_capabilities
            .iter()
            .find_map(|cap| match &cap.access {
                VolumeAccess::Mount { fs_type, .. } => Some(fs_type.clone()),
                VolumeAccess::Block => None,
            })
            .unwrap_or_default();

        let capacity = req.capacity_bytes;

        if let Some(existing) = self.volume_manager.get_by_name(&req.name) {
            if existing.size != capacity {
                return Err(CsiError::AlreadyExists {
                    name: req.name.clone(),
                });
            }

            // Idempotent retry.
            return Ok(Volume {
                volume_id: VolumeId(existing.id),
                capacity_bytes: capacity,
                accessible_topology: self.volume_accessible_topology(),
            });
        }

        let volume_id = Uuid::new_v4().to_string();

        // Serialize volume creation to ensure we won't allocate more than we
        // actually can, as node capacity information is published in
        // intervals.
        let _guard = self.create_lock.lock().await;

        let available = self
            .volume_manager
            .available_capacity()
            .map_err(|e| CsiError::Internal(format!("cannot check node capacity: {e}")))?;
        if capacity > available {
            return Err(CsiError::OutOfRange { available });
        }

        debug!(volume = %volume_id, fs_type = %requested_fs, "provisioning volume");
        self.volume_manager
            .create_volume(&volume_id, &req.name, capacity, AccessType::Mount)
            .await?;

        Ok(Volume {
            volume_id: VolumeId(volume_id),
            capacity_bytes: capacity,
            accessible_topology: self.volume_accessible_topology(),
        })
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        debug!("new DeleteVolume request");

        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id not provided".into()));
        }

        self.volume_manager.delete_volume(&volume_id.0).await?;
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidatedCapabilities, CsiError> {
        debug!(volume_id = %req.volume_id, "new ValidateVolumeCapabilities request");

        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume id missing in request".into(),
            ));
        }

        if self.volume_manager.get_by_id(&req.volume_id.0).is_none() {
            return Err(CsiError::NotFound(format!(
                "volume with id {} does not exist",
                req.volume_id,
            )));
        }

        if !req.volume_context.is_empty() {
            return Err(CsiError::InvalidArgument(format!(
                "expected volume context to be empty but got {:?}",
                req.volume_context,
            )));
        }

        self.validate_capabilities(&req.volume_capabilities)?;
        self.validate_parameters(&req.parameters)?;

        Ok(ValidatedCapabilities {
            volume_capabilities: req.volume_capabilities,
            volume_context: req.volume_context,
            parameters: req.parameters,
        })
    }

    async fn get_capacity(&self) -> Result<i64, CsiError> {
        let capacity = self
            .volume_manager
            .available_capacity()
            .map_err(|e| CsiError::Internal(format!("cannot check node capacity: {e}")))?;

        // The computation can go negative on an overcommitted root; never
        // advertise less than zero.
        Ok(capacity.max(0))
    }

    async fn controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::GetCapacity,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for LocalDriver {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        debug!("new NodePublishVolume request");

        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path not provided".into()));
        }

        self.validate_capabilities(std::slice::from_ref(&req.volume_capability))?;

        let VolumeAccess::Mount { fs_type, mount_flags } = &req.volume_capability.access else {
            return Err(CsiError::InvalidArgument(
                "volume capability access type must be mount".into(),
            ));
        };

        let mut options = vec!["bind".to_owned()];
        if req.readonly {
            options.push("ro".to_owned());
        }
        options.extend(mount_flags.iter().cloned());
        let options = util::unique(options);

        self.volume_manager
            .mount(&req.volume_id.0, Path::new(&req.target_path), fs_type, &options)
            .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(&self, target_path: &str) -> Result<(), CsiError> {
        debug!("new NodeUnpublishVolume request");

        if target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path not provided".into()));
        }

        self.volume_manager.unmount(Path::new(target_path)).await?;
        Ok(())
    }

    async fn volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<Vec<VolumeUsage>, CsiError> {
        debug!(volume_id = %req.volume_id, path = %req.volume_path, "new NodeGetVolumeStats request");

        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id not provided".into()));
        }
        if req.volume_path.is_empty() {
            return Err(CsiError::InvalidArgument("volume path not provided".into()));
        }

        match tokio::fs::symlink_metadata(&req.volume_path).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CsiError::NotFound(format!(
                    "volume path {:?} does not exist",
                    req.volume_path,
                )));
            }
            Err(err) => {
                return Err(CsiError::Internal(format!(
                    "failed to stat volume path {:?}: {err}",
                    req.volume_path,
                )));
            }
        }

        let stats = self
            .volume_manager
            .volume_statistics(Path::new(&req.volume_path))?;

        Ok(vec![
            VolumeUsage {
                available: stats.available_bytes,
                total: stats.total_bytes,
                used: stats.used_bytes,
                unit: UsageUnit::Bytes,
            },
            VolumeUsage {
                available: stats.available_inodes,
                total: stats.total_inodes,
                used: stats.used_inodes,
                unit: UsageUnit::Inodes,
            },
        ])
    }

    async fn node_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_name.clone(),
            max_volumes_per_node: MAX_LIMITS as i64,
            accessible_topology: Some(self.node_accessible_topology()),
        })
    }

    async fn node_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::GetVolumeStats])
    }
}
