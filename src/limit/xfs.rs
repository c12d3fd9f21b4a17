//! XFS project-quota limiter.
//!
//! One project id per volume directory: a fresh id is drawn at random and
//! probed against the quota table, bound to the directory through its
//! `fsxattr` record with `PROJECT_INHERIT`, and enforced with a block
//! hard-limit.  Removal sets the hard-limit back to zero; projects with no
//! field-mask bits are effectively unused by the kernel, so there is nothing
//! further to forget.

use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, error};

use crate::limit::quotactl::{self, DiskQuota, QuotaError, QuotaKind, FS_DQUOT_VERSION, FS_DQ_BHARD};
use crate::limit::{fsxattrs, LimitError, Limiter};
use crate::util;
use crate::volume::state::VolumeRecord;

const FREE_ID_MAX_RETRIES: u32 = 1000;

/// Limiter enforcing per-volume capacity through XFS project quotas.
pub struct XfsLimiter {
    volumes_dir: PathBuf,
    /// Open handle on the volumes root; quota syscalls address the
    /// filesystem through this descriptor.
    root: File,
    /// Serializes id allocation and quota syscalls so two concurrent creates
    /// cannot pick the same project id.
    mutex: Mutex<()>,
}

impl XfsLimiter {
    /// Validates the volumes root and restores the quota of every known
    /// volume.
    ///
    /// Fails when the root is not XFS, when the mount lacks `pquota`/
    /// `prjquota`, or when a recorded directory carries a different project
    /// id than its record (tampering).  Any failure here means the driver
    /// must refuse to serve.
    pub fn new(volumes_dir: impl Into<PathBuf>, volumes: &[VolumeRecord]) -> Result<Self, LimitError> {
        let volumes_dir = volumes_dir.into();

        let fs_type = util::fs::get_filesystem(&volumes_dir)?;
        if fs_type != "xfs" {
            return Err(LimitError::NotXfs(volumes_dir));
        }

        let entry = util::fs::find_mount_entry(&volumes_dir)?
            .ok_or_else(|| LimitError::MountEntryNotFound(volumes_dir.clone()))?;
        if !entry.options.iter().any(|o| o == "pquota" || o == "prjquota") {
            return Err(LimitError::QuotaMountOptionMissing {
                path: volumes_dir,
                options: entry.options,
            });
        }

        let root = File::open(&volumes_dir)?;
        let limiter = Self {
            volumes_dir,
            root,
            mutex: Mutex::new(()),
        };

        for volume in volumes {
            limiter.restore_volume_quota(volume)?;
        }

        Ok(limiter)
    }

    fn restore_volume_quota(&self, volume: &VolumeRecord) -> Result<(), LimitError> {
        let volume_path = volume.volume_path(&self.volumes_dir);
        let dir = File::open(&volume_path)?;

        let project_id = fsxattrs::get_project_id(&dir)?;
        if project_id != volume.limit_id {
            return Err(LimitError::Tampered {
                path: volume_path,
                expected: volume.limit_id,
                found: project_id,
            });
        }

        self.set_limit(volume.limit_id, volume.size)?;
        debug!(volume = %volume.id, limit_id = volume.limit_id, "restored volume quota");
        Ok(())
    }

    fn find_free_project_id(&self) -> Result<u32, LimitError> {
        for _ in 0..FREE_ID_MAX_RETRIES {
            let id: u32 = rand::random();
            if id == 0 {
                // Project id 0 is every unassociated inode.
                continue;
            }
            match quotactl::get_quota(self.root.as_fd(), QuotaKind::Project, id) {
                Err(QuotaError::IdNotFound) => return Ok(id),
                Err(err) => return Err(err.into()),
                // The id already has a quota entry, draw again.
                Ok(_) => continue,
            }
        }

        error!(retries = FREE_ID_MAX_RETRIES, "project id pool exhausted");
        Err(LimitError::IdExhausted(FREE_ID_MAX_RETRIES))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Limiter for XfsLimiter {
    fn new_limit(&self, directory: &Path) -> Result<u32, LimitError> {
        let _guard = self.lock();

        debug!(directory = %directory.display(), "generating project id");
        let project_id = self.find_free_project_id()?;

        // Operate on the opened directory, not the path, to rule out a swap
        // between the probe and the attribute write.
        let dir = File::open(directory)?;
        fsxattrs::set_project_id(&dir, project_id)?;

        Ok(project_id)
    }

    fn set_limit(&self, limit_id: u32, capacity_bytes: i64) -> Result<(), LimitError> {
        let _guard = self.lock();

        debug!(limit_id, capacity_bytes, "setting project quota");
        let quota = DiskQuota {
            version: FS_DQUOT_VERSION,
            flags: QuotaKind::Project as i8,
            field_mask: FS_DQ_BHARD,
            id: limit_id,
            blk_hard_limit: bytes_to_blocks(capacity_bytes),
            ..DiskQuota::default()
        };
        quotactl::set_quota(self.root.as_fd(), QuotaKind::Project, &quota)?;

        Ok(())
    }

    fn remove_limit(&self, limit_id: u32) -> Result<(), LimitError> {
        self.set_limit(limit_id, 0)
    }
}

/// XFS quota block units are basic blocks of 512 bytes.
fn bytes_to_blocks(capacity: i64) -> u64 {
    (capacity >> 9) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_to_blocks_conversion() {
        assert_eq!(bytes_to_blocks(0), 0);
        assert_eq!(bytes_to_blocks(511), 0);
        assert_eq!(bytes_to_blocks(512), 1);
        assert_eq!(bytes_to_blocks(1024 * 1024), 2048);
    }

    #[test]
    fn refuses_non_xfs_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        // A tempdir is not a dedicated quota-enabled XFS mount point, so
        // construction must fail cleanly on one of the startup checks.
        let result = XfsLimiter::new(tmp.path(), &[]);
        assert!(matches!(
            result,
            Err(LimitError::NotXfs(_)
                | LimitError::MountEntryNotFound(_)
                | LimitError::QuotaMountOptionMissing { .. })
        ));
    }
}
