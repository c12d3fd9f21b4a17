//! Per-directory capacity limiting.
//!
//! A [`Limiter`] binds a numeric limit id to a volume directory and enforces
//! a byte capacity against it.  Two implementations exist: [`xfs::XfsLimiter`]
//! enforces limits with XFS project quotas, and [`NoopLimiter`] is wired in
//! when the volumes root cannot enforce quotas, making capacity advisory.

pub mod fsxattrs;
pub mod quotactl;
pub mod xfs;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use thiserror::Error;
use tracing::info;

use crate::util;
use crate::volume::state::VolumeRecord;

/// The largest number of limits (and therefore volumes) a node can hold.
pub const MAX_LIMITS: u32 = u32::MAX;

/// Errors produced while managing limits.
#[derive(Debug, Error)]
pub enum LimitError {
    /// The volumes root is not on an XFS filesystem.
    #[error("volumes path {0:?} is not an XFS filesystem")]
    NotXfs(PathBuf),

    /// The volumes root has no entry in the mount table.
    #[error("mount entry for {0:?} not found")]
    MountEntryNotFound(PathBuf),

    /// The volumes root is XFS but project quotas are not enabled.
    #[error("xfs path {path:?} was not mounted with pquota nor prjquota (options: {options:?})")]
    QuotaMountOptionMissing {
        path: PathBuf,
        options: Vec<String>,
    },

    /// A volume directory carries a different project id than its record.
    #[error("found tampered directory {path:?}, expected project id {expected}, got {found}")]
    Tampered {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    /// The random probe could not find an unused project id.
    #[error("unable to generate a free project id with {0} retries")]
    IdExhausted(u32),

    /// A quota syscall failed.
    #[error(transparent)]
    Quota(#[from] quotactl::QuotaError),

    /// An fsxattr ioctl failed.
    #[error("fsxattr ioctl failed: {0}")]
    Ioctl(#[from] Errno),

    /// A file operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Assigns and enforces capacity limits on volume directories.
pub trait Limiter: Send + Sync {
    /// Binds a fresh limit id to `directory` and returns it.
    ///
    /// The id is not persisted here; recording the id ↔ volume binding is the
    /// caller's responsibility.
    fn new_limit(&self, directory: &Path) -> Result<u32, LimitError>;

    /// Sets the capacity enforced for `limit_id` to `capacity_bytes`.
    fn set_limit(&self, limit_id: u32, capacity_bytes: i64) -> Result<(), LimitError>;

    /// Stops enforcing any capacity for `limit_id`.
    fn remove_limit(&self, limit_id: u32) -> Result<(), LimitError>;
}

/// Limiter used when quotas are unavailable; always hands out id 0 and
/// performs no syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLimiter;

impl Limiter for NoopLimiter {
    fn new_limit(&self, _directory: &Path) -> Result<u32, LimitError> {
        Ok(0)
    }

    fn set_limit(&self, _limit_id: u32, _capacity_bytes: i64) -> Result<(), LimitError> {
        Ok(())
    }

    fn remove_limit(&self, _limit_id: u32) -> Result<(), LimitError> {
        Ok(())
    }
}

/// Picks the limiter for `volumes_dir`: the XFS limiter when the root is XFS,
/// the no-op limiter otherwise.
///
/// `volumes` are the records known at startup; the XFS limiter cross-checks
/// and restores their quotas before serving.
pub fn select_limiter(
    volumes_dir: &Path,
    volumes: &[VolumeRecord],
) -> Result<Arc<dyn Limiter>, LimitError> {
    let fs_type = util::fs::get_filesystem(volumes_dir)?;
    if fs_type == "xfs" {
        let limiter = xfs::XfsLimiter::new(volumes_dir, volumes)?;
        info!(path = %volumes_dir.display(), "using XFS project-quota limiter");
        return Ok(Arc::new(limiter));
    }

    info!(
        path = %volumes_dir.display(),
        %fs_type,
        "volumes root cannot enforce quotas, capacity will be advisory",
    );
    Ok(Arc::new(NoopLimiter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_limiter_hands_out_id_zero() {
        let limiter = NoopLimiter;
        let id = limiter.new_limit(Path::new("/nonexistent")).expect("new limit");
        assert_eq!(id, 0);
        limiter.set_limit(id, 1024).expect("set limit");
        limiter.remove_limit(id).expect("remove limit");
    }
}
