//! # local-csi — node-local CSI volume provisioner
//!
//! `local-csi` implements a [Container Storage Interface][csi] driver that
//! owns one pre-mounted directory per node (the *volumes root*) and carves
//! it into per-volume subdirectories, published to workloads via bind
//! mounts.  When the root is an XFS filesystem mounted with project-quota
//! support, per-volume capacity is enforced at the kernel level with XFS
//! project quotas; otherwise capacity is advisory.  It follows the usual
//! stack conventions (Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`message`] | [`CsiMessage`] protocol envelope for the transport. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait — volume create/delete/capacity. |
//! | [`node`] | [`CsiNode`] trait — publish, unpublish, stats. |
//! | [`driver`] | [`LocalDriver`] — the services over one volumes root. |
//! | [`volume`] | Volume manager, state store, and mount plumbing. |
//! | [`limit`] | Capacity limiters: XFS project quotas or no-op. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`util`] | Filesystem probing and small helpers. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod limit;
pub mod message;
pub mod node;
pub mod transport;
pub mod types;
pub mod util;
pub mod volume;

// Re-export the most commonly used items at crate root for convenience.
pub use controller::CsiController;
pub use driver::LocalDriver;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
