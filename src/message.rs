//! CSI protocol messages transmitted over the transport layer.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between a CSI client (the orchestrator side) and the
//! CSI server (the node side) via QUIC bi-directional streams.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Create a new volume (Controller).
    CreateVolume(CreateVolumeRequest),
    /// Delete a volume (Controller).
    DeleteVolume(VolumeId),
    /// Query remaining capacity (Controller).
    GetCapacity,
    /// Validate volume capabilities (Controller).
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    /// Query Controller capabilities (Controller).
    GetControllerCapabilities,

    /// Publish (bind-mount) a volume into a workload path (Node).
    PublishVolume(NodePublishVolumeRequest),
    /// Unpublish a previously published volume (Node).
    UnpublishVolume {
        target_path: String,
    },
    /// Query usage of a published volume (Node).
    GetVolumeStats(NodeGetVolumeStatsRequest),
    /// Query node info (Node).
    GetNodeInfo,
    /// Query Node capabilities (Node).
    GetNodeCapabilities,

    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,

    // ----- Responses -------------------------------------------------------
    /// A volume was successfully created.
    VolumeCreated(Volume),
    /// Available capacity in bytes.
    Capacity(i64),
    /// The requested capabilities were validated; the request is echoed.
    CapabilitiesValidated(ValidatedCapabilities),
    /// Controller capabilities.
    ControllerCapabilities(Vec<ControllerCapability>),
    /// Usage figures for a published volume.
    VolumeStats(Vec<VolumeUsage>),
    /// Node information.
    NodeInfoResponse(NodeInfo),
    /// Node capabilities.
    NodeCapabilities(Vec<NodeCapability>),
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    /// Probe result.
    ProbeResult(bool),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// An error occurred.
    Error(CsiError),
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({})", id),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "ValidateVolumeCapabilities({})", req.volume_id)
            }
            Self::GetControllerCapabilities => f.write_str("GetControllerCapabilities"),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { target_path } => {
                write!(f, "UnpublishVolume({})", target_path)
            }
            Self::GetVolumeStats(req) => write!(f, "GetVolumeStats({})", req.volume_id),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::GetNodeCapabilities => f.write_str("GetNodeCapabilities"),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::Capacity(c) => write!(f, "Capacity({})", c),
            Self::CapabilitiesValidated(_) => f.write_str("CapabilitiesValidated"),
            Self::ControllerCapabilities(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::VolumeStats(usage) => write!(f, "VolumeStats(count={})", usage.len()),
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::NodeCapabilities(caps) => write!(f, "NodeCapabilities(count={})", caps.len()),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}
