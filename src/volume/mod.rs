//! Volume lifecycle orchestration.
//!
//! The [`VolumeManager`] owns the volumes root: it creates and deletes the
//! per-volume directories, drives the [`Limiter`] and the [`StateStore`]
//! through each transition, rolls partially created volumes back, publishes
//! volumes with bind mounts, and accounts node capacity.
//!
//! The limiter and the mounter are injected at construction; tests wire in
//! fakes, production wires [`crate::limit::NoopLimiter`] or
//! [`crate::limit::xfs::XfsLimiter`] and [`LinuxMounter`].

pub mod state;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::sys::statfs;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::error::CsiError;
use crate::limit::{LimitError, Limiter};
use state::{StateError, StateStore, VolumeRecord, METADATA_FILE_MAX_SIZE};

/// How a workload accesses a volume's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Through a mounted filesystem.
    Mount,
    /// As a raw block device.
    Block,
}

/// Filesystem usage of a published volume, from `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStatistics {
    pub available_bytes: i64,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_inodes: i64,
    pub total_inodes: i64,
    pub used_inodes: i64,
}

/// Errors produced by the volume manager.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("requested volume capacity of {requested}B exceeds available one ({available}B)")]
    OutOfCapacity { requested: i64, available: i64 },

    #[error("unsupported access type {0:?}")]
    UnsupportedAccessType(AccessType),

    #[error("can't create directory at {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("can't remove directory at {path:?}: {source}")]
    RemoveDir { path: PathBuf, source: io::Error },

    #[error("can't statfs {path:?}: {source}")]
    Statfs { path: PathBuf, source: Errno },

    #[error("can't mount {source_path:?} at {target:?}: {source}")]
    Mount {
        source_path: PathBuf,
        target: PathBuf,
        source: io::Error,
    },

    #[error("can't unmount {target:?}: {source}")]
    Unmount { target: PathBuf, source: io::Error },

    #[error(transparent)]
    Limit(#[from] LimitError),

    #[error(transparent)]
    State(#[from] StateError),

    /// A creation step failed and some of its rollback steps failed too.
    #[error("{primary}; rollback failures: {failures:?}")]
    CreateUnwound {
        primary: Box<VolumeError>,
        failures: Vec<String>,
    },
}

impl From<VolumeError> for CsiError {
    fn from(err: VolumeError) -> Self {
        match &err {
            VolumeError::OutOfCapacity { available, .. } => CsiError::OutOfRange {
                available: *available,
            },
            VolumeError::Limit(LimitError::IdExhausted(_)) => {
                CsiError::ResourceExhausted(err.to_string())
            }
            VolumeError::CreateUnwound { primary, .. }
                if matches!(**primary, VolumeError::Limit(LimitError::IdExhausted(_))) =>
            {
                CsiError::ResourceExhausted(err.to_string())
            }
            _ => CsiError::Internal(err.to_string()),
        }
    }
}

/// Mounts volume directories into workload target paths.
///
/// The real implementation calls the kernel; tests inject a fake.
pub trait Mounter: Send + Sync {
    /// Mounts `source` at `target` with the given filesystem type and
    /// option strings.
    fn mount(&self, source: &Path, target: &Path, fs_type: &str, options: &[String])
        -> io::Result<()>;

    /// Unmounts `target`.
    fn unmount(&self, target: &Path) -> io::Result<()>;
}

/// [`Mounter`] backed by `mount(2)`/`umount(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxMounter;

impl Mounter for LinuxMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> io::Result<()> {
        let mut flags = MsFlags::empty();
        let mut data: Vec<&str> = Vec::new();
        for option in options {
            match option.as_str() {
                "bind" => flags |= MsFlags::MS_BIND,
                "ro" => flags |= MsFlags::MS_RDONLY,
                "noatime" => flags |= MsFlags::MS_NOATIME,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                other => data.push(other),
            }
        }
        let data = data.join(",");

        nix::mount::mount(
            Some(source),
            target,
            (!fs_type.is_empty()).then_some(fs_type),
            flags,
            (!data.is_empty()).then_some(data.as_str()),
        )
        .map_err(io::Error::from)?;

        // A bind mount ignores MS_RDONLY on the initial call on some
        // kernels; apply it with a remount.
        if flags.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY) {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(io::Error::from)?;
        }

        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        nix::mount::umount(target).map_err(io::Error::from)
    }
}

/// Orchestrates the volume lifecycle under one volumes root.
pub struct VolumeManager {
    volumes_dir: PathBuf,
    state: Arc<StateStore>,
    limiter: Arc<dyn Limiter>,
    mounter: Arc<dyn Mounter>,
}

impl VolumeManager {
    pub fn new(
        volumes_dir: impl Into<PathBuf>,
        state: Arc<StateStore>,
        limiter: Arc<dyn Limiter>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            volumes_dir: volumes_dir.into(),
            state,
            limiter,
            mounter,
        }
    }

    /// Access types this driver can provision.
    pub fn supported_access_types(&self) -> &'static [AccessType] {
        &[AccessType::Mount]
    }

    /// Filesystem type strings this driver accepts in capabilities.
    pub fn supported_filesystems(&self) -> &'static [&'static str] {
        &["", "xfs"]
    }

    pub fn get_by_id(&self, id: &str) -> Option<VolumeRecord> {
        self.state.get_by_id(id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<VolumeRecord> {
        self.state.get_by_name(name)
    }

    fn volume_path(&self, id: &str) -> PathBuf {
        self.volumes_dir.join(id)
    }

    /// Creates the volume directory, binds a limit to it, records the volume
    /// durably and enforces the capacity, unwinding everything already done
    /// when a later step fails.
    ///
    /// An existing directory is accepted so that a retried create converges.
    pub async fn create_volume(
        &self,
        id: &str,
        name: &str,
        capacity: i64,
        access_type: AccessType,
    ) -> Result<(), VolumeError> {
        let available = self.available_capacity()?;
        if capacity > available {
            return Err(VolumeError::OutOfCapacity {
                requested: capacity,
                available,
            });
        }

        if !self.supported_access_types().contains(&access_type) {
            return Err(VolumeError::UnsupportedAccessType(access_type));
        }

        let path = self.volume_path(id);
        info!(path = %path.display(), "creating volume directory");
        make_dir_0770(&path).await?;

        let limit_id = match self.limiter.new_limit(&path) {
            Ok(limit_id) => limit_id,
            Err(err) => {
                let failures = self.unwind(&path, None, None);
                return Err(wrap_unwound(err.into(), failures));
            }
        };
        debug!(limit_id, path = %path.display(), "new limit initialized");

        let record = VolumeRecord {
            name: name.to_owned(),
            id: id.to_owned(),
            limit_id,
            size: capacity,
        };
        if let Err(err) = self.state.save(&record) {
            let failures = self.unwind(&path, Some(limit_id), None);
            return Err(wrap_unwound(err.into(), failures));
        }

        if let Err(err) = self.limiter.set_limit(limit_id, capacity) {
            let failures = self.unwind(&path, Some(limit_id), Some(id));
            return Err(wrap_unwound(err.into(), failures));
        }

        info!(volume = id, name, capacity, limit_id, "volume created");
        Ok(())
    }

    /// Rolls back a partially created volume, returning descriptions of the
    /// rollback steps that themselves failed.
    fn unwind(&self, path: &Path, limit_id: Option<u32>, state_id: Option<&str>) -> Vec<String> {
        let mut failures = Vec::new();

        if let Err(err) = std::fs::remove_dir(path) {
            if err.kind() != io::ErrorKind::NotFound {
                error!(path = %path.display(), %err, "rollback: can't remove volume directory");
                failures.push(format!("can't remove volume directory: {err}"));
            }
        }

        if let Some(limit_id) = limit_id {
            if let Err(err) = self.limiter.remove_limit(limit_id) {
                error!(limit_id, %err, "rollback: can't remove limit");
                failures.push(format!("can't remove limit {limit_id}: {err}"));
            }
        }

        if let Some(id) = state_id {
            if let Err(err) = self.state.delete(id) {
                error!(volume = id, %err, "rollback: can't delete volume state");
                failures.push(format!("can't delete volume state: {err}"));
            }
        }

        failures
    }

    /// Removes the volume's directory, limit and record.
    ///
    /// Safe for unknown ids and safe to retry; every step treats "already
    /// gone" as success.
    pub async fn delete_volume(&self, id: &str) -> Result<(), VolumeError> {
        let record = self.state.get_by_id(id);

        let path = self.volume_path(id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => info!(volume = id, path = %path.display(), "removed volume directory"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(VolumeError::RemoveDir { path, source }),
        }

        if let Some(record) = &record {
            self.limiter.remove_limit(record.limit_id)?;
            debug!(limit_id = record.limit_id, "removed limit");
        }

        self.state.delete(id)?;
        debug!(volume = id, "removed volume state");

        Ok(())
    }

    /// Free capacity in bytes: the raw device capacity minus every
    /// provisioned volume size and a metadata reserve for each existing
    /// record plus one future record.
    ///
    /// May be negative when the root is consumed out-of-band; callers clamp
    /// before advertising.
    pub fn available_capacity(&self) -> Result<i64, VolumeError> {
        let stat = statfs::statfs(&self.volumes_dir).map_err(|source| VolumeError::Statfs {
            path: self.volumes_dir.clone(),
            source,
        })?;

        let metadata_reserve = (self.state.volume_count() as i64 + 1) * METADATA_FILE_MAX_SIZE;
        let raw = stat.block_size() as i64 * stat.blocks() as i64;

        Ok(raw - self.state.total_size() - metadata_reserve)
    }

    /// Usage of the filesystem visible at `volume_path`.
    ///
    /// Inode figures are global to the backing filesystem.
    pub fn volume_statistics(&self, volume_path: &Path) -> Result<VolumeStatistics, VolumeError> {
        let stat = statfs::statfs(volume_path).map_err(|source| VolumeError::Statfs {
            path: volume_path.to_owned(),
            source,
        })?;

        let block_size = stat.block_size() as i64;
        Ok(VolumeStatistics {
            available_bytes: stat.blocks_available() as i64 * block_size,
            total_bytes: stat.blocks() as i64 * block_size,
            used_bytes: (stat.blocks() as i64 - stat.blocks_free() as i64) * block_size,
            available_inodes: stat.files_free() as i64,
            total_inodes: stat.files() as i64,
            used_inodes: stat.files() as i64 - stat.files_free() as i64,
        })
    }

    /// Bind-mounts the volume's directory onto `target_path`.
    pub async fn mount(
        &self,
        id: &str,
        target_path: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), VolumeError> {
        let path = self.volume_path(id);

        make_dir_0770(target_path).await?;

        info!(path = %path.display(), target = %target_path.display(), "mounting volume directory");
        self.mounter
            .mount(&path, target_path, fs_type, options)
            .map_err(|source| VolumeError::Mount {
                source_path: path,
                target: target_path.to_owned(),
                source,
            })?;

        Ok(())
    }

    /// Unmounts `target_path` and removes the mount point.
    pub async fn unmount(&self, target_path: &Path) -> Result<(), VolumeError> {
        self.mounter
            .unmount(target_path)
            .map_err(|source| VolumeError::Unmount {
                target: target_path.to_owned(),
                source,
            })?;

        match tokio::fs::remove_dir(target_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(VolumeError::RemoveDir {
                path: target_path.to_owned(),
                source,
            }),
        }
    }
}

fn wrap_unwound(primary: VolumeError, failures: Vec<String>) -> VolumeError {
    if failures.is_empty() {
        primary
    } else {
        VolumeError::CreateUnwound {
            primary: Box::new(primary),
            failures,
        }
    }
}

async fn make_dir_0770(path: &Path) -> Result<(), VolumeError> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.mode(0o770);
    match builder.create(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(VolumeError::CreateDir {
            path: path.to_owned(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLimiter {
        next_id: AtomicU32,
        set_calls: Mutex<Vec<(u32, i64)>>,
        removed: Mutex<Vec<u32>>,
        fail_new_limit: bool,
        fail_set_limit: bool,
    }

    impl FakeLimiter {
        fn starting_at(id: u32) -> Self {
            Self {
                next_id: AtomicU32::new(id),
                ..Self::default()
            }
        }
    }

    impl Limiter for FakeLimiter {
        fn new_limit(&self, _directory: &Path) -> Result<u32, LimitError> {
            if self.fail_new_limit {
                return Err(LimitError::IdExhausted(1000));
            }
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn set_limit(&self, limit_id: u32, capacity_bytes: i64) -> Result<(), LimitError> {
            if self.fail_set_limit {
                return Err(LimitError::Quota(
                    crate::limit::quotactl::QuotaError::IdNotFound,
                ));
            }
            self.set_calls
                .lock()
                .expect("lock")
                .push((limit_id, capacity_bytes));
            Ok(())
        }

        fn remove_limit(&self, limit_id: u32) -> Result<(), LimitError> {
            self.removed.lock().expect("lock").push(limit_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMounter {
        mounts: Mutex<Vec<(PathBuf, PathBuf, String, Vec<String>)>>,
        unmounts: Mutex<Vec<PathBuf>>,
    }

    impl Mounter for FakeMounter {
        fn mount(
            &self,
            source: &Path,
            target: &Path,
            fs_type: &str,
            options: &[String],
        ) -> io::Result<()> {
            self.mounts.lock().expect("lock").push((
                source.to_owned(),
                target.to_owned(),
                fs_type.to_owned(),
                options.to_vec(),
            ));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> io::Result<()> {
            self.unmounts.lock().expect("lock").push(target.to_owned());
            Ok(())
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        volumes_dir: PathBuf,
        limiter: Arc<FakeLimiter>,
        mounter: Arc<FakeMounter>,
        manager: VolumeManager,
    }

    fn fixture_with_limiter(limiter: FakeLimiter) -> Fixture {
        let tmp = tempfile::tempdir().expect("tempdir");
        let volumes_dir = tmp.path().to_owned();
        let state = Arc::new(StateStore::load(&volumes_dir).expect("load state"));
        let limiter = Arc::new(limiter);
        let mounter = Arc::new(FakeMounter::default());
        let manager = VolumeManager::new(
            &volumes_dir,
            state,
            limiter.clone(),
            mounter.clone(),
        );
        Fixture {
            _tmp: tmp,
            volumes_dir,
            limiter,
            mounter,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_limiter(FakeLimiter::starting_at(7))
    }

    #[tokio::test]
    async fn create_and_delete_volume() {
        let fx = fixture();

        fx.manager
            .create_volume("vol-uuid", "vol-1", 1 << 20, AccessType::Mount)
            .await
            .expect("create");

        let volume_dir = fx.volumes_dir.join("vol-uuid");
        let mode = fs::metadata(&volume_dir).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o770);

        let record = fx.manager.get_by_id("vol-uuid").expect("record");
        assert_eq!(record.name, "vol-1");
        assert_eq!(record.limit_id, 7);
        assert_eq!(record.size, 1 << 20);
        assert_eq!(fx.manager.get_by_name("vol-1"), Some(record));
        assert!(fx.volumes_dir.join("vol-uuid.json").exists());
        assert_eq!(
            *fx.limiter.set_calls.lock().expect("lock"),
            vec![(7, 1 << 20)]
        );

        fx.manager.delete_volume("vol-uuid").await.expect("delete");
        assert!(!volume_dir.exists());
        assert!(!fx.volumes_dir.join("vol-uuid.json").exists());
        assert_eq!(fx.manager.get_by_id("vol-uuid"), None);
        assert_eq!(*fx.limiter.removed.lock().expect("lock"), vec![7]);
    }

    #[tokio::test]
    async fn create_is_idempotent_for_an_existing_directory() {
        let fx = fixture();
        fs::create_dir(fx.volumes_dir.join("vol-uuid")).expect("mkdir");

        fx.manager
            .create_volume("vol-uuid", "vol-1", 4096, AccessType::Mount)
            .await
            .expect("create over existing directory");
    }

    #[tokio::test]
    async fn delete_of_unknown_volume_succeeds() {
        let fx = fixture();
        fx.manager.delete_volume("missing").await.expect("delete");
        // Repeat delete converges too.
        fx.manager.delete_volume("missing").await.expect("delete again");
    }

    #[tokio::test]
    async fn block_access_is_rejected() {
        let fx = fixture();
        let err = fx
            .manager
            .create_volume("vol-uuid", "vol-1", 4096, AccessType::Block)
            .await
            .expect_err("block access");
        assert!(matches!(err, VolumeError::UnsupportedAccessType(AccessType::Block)));
        assert!(!fx.volumes_dir.join("vol-uuid").exists());
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_before_any_side_effect() {
        let fx = fixture();
        let available = fx.manager.available_capacity().expect("capacity");

        let err = fx
            .manager
            .create_volume("vol-uuid", "vol-1", available + 1, AccessType::Mount)
            .await
            .expect_err("oversized");
        assert!(matches!(err, VolumeError::OutOfCapacity { .. }));
        assert!(!fx.volumes_dir.join("vol-uuid").exists());
        assert!(!fx.volumes_dir.join("vol-uuid.json").exists());
    }

    #[tokio::test]
    async fn capacity_shrinks_by_size_plus_metadata_reserve() {
        let fx = fixture();
        let before = fx.manager.available_capacity().expect("capacity");

        fx.manager
            .create_volume("vol-uuid", "vol-1", 1 << 20, AccessType::Mount)
            .await
            .expect("create");
        let after = fx.manager.available_capacity().expect("capacity");
        assert_eq!(after, before - (1 << 20) - METADATA_FILE_MAX_SIZE);

        fx.manager.delete_volume("vol-uuid").await.expect("delete");
        assert_eq!(fx.manager.available_capacity().expect("capacity"), before);
    }

    #[tokio::test]
    async fn failed_limit_allocation_removes_the_directory() {
        let fx = fixture_with_limiter(FakeLimiter {
            fail_new_limit: true,
            ..FakeLimiter::default()
        });

        let err = fx
            .manager
            .create_volume("vol-uuid", "vol-1", 4096, AccessType::Mount)
            .await
            .expect_err("create");
        assert!(matches!(err, VolumeError::Limit(LimitError::IdExhausted(_))));
        assert!(!fx.volumes_dir.join("vol-uuid").exists());
        assert!(!fx.volumes_dir.join("vol-uuid.json").exists());
    }

    #[tokio::test]
    async fn failed_state_save_unwinds_directory_and_limit() {
        let fx = fixture();
        // A directory squatting on the state-file path makes the save fail.
        fs::create_dir(fx.volumes_dir.join("vol-uuid.json")).expect("mkdir");

        let err = fx
            .manager
            .create_volume("vol-uuid", "vol-1", 4096, AccessType::Mount)
            .await
            .expect_err("create");
        assert!(matches!(
            err,
            VolumeError::State(_) | VolumeError::CreateUnwound { .. }
        ));
        assert!(!fx.volumes_dir.join("vol-uuid").exists());
        assert_eq!(*fx.limiter.removed.lock().expect("lock"), vec![0]);
        assert_eq!(fx.manager.get_by_id("vol-uuid"), None);
    }

    #[tokio::test]
    async fn failed_set_limit_unwinds_everything() {
        let fx = fixture_with_limiter(FakeLimiter {
            fail_set_limit: true,
            ..FakeLimiter::default()
        });

        let err = fx
            .manager
            .create_volume("vol-uuid", "vol-1", 4096, AccessType::Mount)
            .await
            .expect_err("create");
        assert!(matches!(err, VolumeError::Limit(_) | VolumeError::CreateUnwound { .. }));

        // The volumes root is back to its pre-call state.
        assert!(!fx.volumes_dir.join("vol-uuid").exists());
        assert!(!fx.volumes_dir.join("vol-uuid.json").exists());
        assert_eq!(fx.manager.get_by_id("vol-uuid"), None);
        assert_eq!(fx.manager.get_by_name("vol-1"), None);
        assert_eq!(*fx.limiter.removed.lock().expect("lock"), vec![0]);
    }

    #[tokio::test]
    async fn mount_creates_the_target_and_forwards_options() {
        let fx = fixture();
        fx.manager
            .create_volume("vol-uuid", "vol-1", 4096, AccessType::Mount)
            .await
            .expect("create");

        let target = fx.volumes_dir.join("target");
        let options = vec!["bind".to_owned(), "ro".to_owned()];
        fx.manager
            .mount("vol-uuid", &target, "", &options)
            .await
            .expect("mount");

        assert!(target.is_dir());
        let mounts = fx.mounter.mounts.lock().expect("lock");
        assert_eq!(
            *mounts,
            vec![(
                fx.volumes_dir.join("vol-uuid"),
                target.clone(),
                String::new(),
                options,
            )]
        );
    }

    #[tokio::test]
    async fn unmount_removes_the_target_path() {
        let fx = fixture();
        let target = fx.volumes_dir.join("target");
        fs::create_dir(&target).expect("mkdir");

        fx.manager.unmount(&target).await.expect("unmount");
        assert!(!target.exists());
        assert_eq!(*fx.mounter.unmounts.lock().expect("lock"), vec![target]);
    }

    #[tokio::test]
    async fn volume_statistics_reports_bytes_and_inodes() {
        let fx = fixture();
        let stats = fx
            .manager
            .volume_statistics(&fx.volumes_dir)
            .expect("statistics");

        assert!(stats.total_bytes > 0);
        assert!(stats.available_bytes <= stats.total_bytes);
        assert!(stats.used_bytes >= 0);
        assert!(stats.used_bytes <= stats.total_bytes);
        assert!(stats.total_inodes >= stats.used_inodes);
    }
}
