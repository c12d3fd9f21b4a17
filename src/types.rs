//! Core CSI types: volumes, capabilities, requests, topology, and usage.
//!
//! These types form the data model shared by the CSI service traits, the
//! transport layer, and the driver.  They are all [`Serialize`]/
//! [`Deserialize`] so they can be transmitted over the wire as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be shared between workloads.
///
/// This driver provisions node-local directories, so only
/// [`AccessMode::SingleNodeWriter`] is accepted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    SingleNodeWriter,
    /// Single-node read-only.
    SingleNodeReaderOnly,
    /// Multi-node read-only.
    MultiNodeReaderOnly,
    /// Multi-node, at most one writer.
    MultiNodeSingleWriter,
    /// Multi-node read-write.
    MultiNodeMultiWriter,
}

/// Requested access to the volume data: a mounted filesystem or a raw block
/// device.  Only filesystem access is supported by this driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeAccess {
    /// Mounted filesystem.
    Mount {
        /// Requested filesystem type; empty means "driver default".
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// Raw block device.
    Block,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Requested access type.
    pub access: VolumeAccess,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"local.csi.localvol.dev/node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

/// The set of topologies a new volume must be accessible from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyRequirement {
    /// Topologies the provisioned volume must be reachable from.
    #[serde(default)]
    pub requisite: Vec<Topology>,
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// Metadata for a provisioned volume, as returned to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: i64,
    /// Topology constraints pinning the volume to its node.
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Logical name for the volume, unique per node.
    pub name: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: i64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters.  This driver accepts none.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Topologies the volume must be accessible from.
    #[serde(default)]
    pub accessibility_requirements: Option<TopologyRequirement>,
}

/// Request to validate that a volume supports the given capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    /// Volume to validate.
    pub volume_id: VolumeId,
    /// Context carried from volume creation; must be empty for this driver.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Capabilities to validate.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Parameters to validate.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Confirmation echoed back when capability validation succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedCapabilities {
    /// The validated capabilities.
    pub volume_capabilities: Vec<VolumeCapability>,
    /// The validated volume context.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// The validated parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to publish (bind-mount) a volume into a workload path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Target path inside the workload's mount namespace.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// Request for filesystem usage statistics of a published volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsRequest {
    /// Volume to inspect.
    pub volume_id: VolumeId,
    /// Path the volume is published at.
    pub volume_path: String,
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Unit of a [`VolumeUsage`] entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

/// One usage figure for a published volume.
///
/// Inode counts come from `statfs` and are global to the backing filesystem,
/// so they may exceed what a single volume accounts for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    /// Free units.
    pub available: i64,
    /// Total units.
    pub total: i64,
    /// Used units (`total - free`).
    pub used: i64,
    /// What the figures count.
    pub unit: UsageUnit,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"local.csi.localvol.dev"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// Capabilities advertised by the Controller service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    /// Controller can create and delete volumes.
    CreateDeleteVolume,
    /// Controller can report node capacity.
    GetCapacity,
}

/// Capabilities advertised by the Node service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    /// Node can report volume usage statistics.
    GetVolumeStats,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes_per_node: i64,
    /// Topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
