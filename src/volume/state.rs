//! Durable per-volume state.
//!
//! Every provisioned volume is recorded in one JSON file,
//! `<volumes_root>/<id>.json`, next to the volume directory itself.  The
//! [`StateStore`] rebuilds its in-memory indices from those files at startup
//! and keeps them consistent with the disk afterwards: a record reaches
//! durable bytes before the indices treat it as authoritative, and is removed
//! from disk before the indices forget it.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const STATE_FILE_EXTENSION: &str = "json";

/// Upper bound of one serialized record on disk.  Reserved per volume (plus
/// one future volume) when computing allocatable capacity.
pub const METADATA_FILE_MAX_SIZE: i64 = 4 * 1024;

/// Durable description of one provisioned volume.
///
/// Unknown keys in existing files are tolerated on read; only the listed
/// keys are ever written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Controller-supplied logical name, unique per node.
    #[serde(default)]
    pub name: String,
    /// Node-unique volume id (random UUID string).
    #[serde(default)]
    pub id: String,
    /// XFS project id bound to the volume directory; 0 when quotas are not
    /// enforced.
    #[serde(rename = "limitID", default)]
    pub limit_id: u32,
    /// Requested hard capacity in bytes.
    #[serde(default)]
    pub size: i64,
}

impl VolumeRecord {
    /// The volume's directory under `volumes_dir`.
    pub fn volume_path(&self, volumes_dir: &Path) -> PathBuf {
        volumes_dir.join(&self.id)
    }

    /// Whether the record is missing its identity and must be ignored.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() || self.id.is_empty()
    }
}

/// Errors produced by the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("can't parse state file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("can't encode volume record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Default)]
struct StateIndex {
    by_id: HashMap<String, VolumeRecord>,
    by_name: HashMap<String, String>,
    total_size: i64,
}

/// In-memory indices over the per-volume state files.
pub struct StateStore {
    volumes_dir: PathBuf,
    inner: RwLock<StateIndex>,
}

impl StateStore {
    /// Loads every `<id>.json` record one level deep under `volumes_dir`.
    ///
    /// Subdirectories (the volumes themselves) are skipped entirely.
    /// Records that parse but carry no id or name are logged and ignored; a
    /// file that fails to parse fails the load.
    pub fn load(volumes_dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let volumes_dir = volumes_dir.into();
        let mut index = StateIndex::default();

        for entry in fs::read_dir(&volumes_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }

            let path = entry.path();
            if path.extension().and_then(OsStr::to_str) != Some(STATE_FILE_EXTENSION) {
                continue;
            }

            let record = parse_record_file(&path)?;
            if record.is_empty() {
                warn!(
                    path = %path.display(),
                    "ignoring state file because it doesn't contain volume information",
                );
                continue;
            }

            index.total_size += record.size;
            index.by_name.insert(record.name.clone(), record.id.clone());
            index.by_id.insert(record.id.clone(), record);
        }

        Ok(Self {
            volumes_dir,
            inner: RwLock::new(index),
        })
    }

    fn state_file_path(&self, id: &str) -> PathBuf {
        self.volumes_dir.join(format!("{id}.{STATE_FILE_EXTENSION}"))
    }

    fn read(&self) -> RwLockReadGuard<'_, StateIndex> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StateIndex> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the record for `id`, if any.
    pub fn get_by_id(&self, id: &str) -> Option<VolumeRecord> {
        self.read().by_id.get(id).cloned()
    }

    /// Returns a copy of the record named `name`, if any.
    pub fn get_by_name(&self, name: &str) -> Option<VolumeRecord> {
        let inner = self.read();
        inner
            .by_name
            .get(name)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Persists `record` and then publishes it in the indices.
    ///
    /// The file reaches disk before the in-memory state changes; a crash in
    /// between is repaired by the next [`StateStore::load`].
    pub fn save(&self, record: &VolumeRecord) -> Result<(), StateError> {
        let path = self.state_file_path(&record.id);
        let data = serde_json::to_vec(record).map_err(StateError::Encode)?;
        fs::write(&path, &data)?;

        let mut inner = self.write();
        inner.total_size += record.size;
        inner.by_name.insert(record.name.clone(), record.id.clone());
        inner.by_id.insert(record.id.clone(), record.clone());

        Ok(())
    }

    /// Removes the record for `id` from disk and then from the indices.
    /// An already-absent file counts as success.
    pub fn delete(&self, id: &str) -> Result<(), StateError> {
        let path = self.state_file_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut inner = self.write();
        if let Some(record) = inner.by_id.remove(id) {
            inner.by_name.remove(&record.name);
            inner.total_size -= record.size;
        }

        Ok(())
    }

    /// Sum of the provisioned sizes of all known volumes, in bytes.
    pub fn total_size(&self) -> i64 {
        self.read().total_size
    }

    /// Number of known volumes.
    pub fn volume_count(&self) -> usize {
        self.read().by_id.len()
    }

    /// Snapshot of all known records.
    pub fn volumes(&self) -> Vec<VolumeRecord> {
        self.read().by_id.values().cloned().collect()
    }
}

fn parse_record_file(path: &Path) -> Result<VolumeRecord, StateError> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(|source| StateError::Parse {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(id: &str, name: &str) -> VolumeRecord {
        VolumeRecord {
            name: name.to_owned(),
            id: id.to_owned(),
            limit_id: 1,
            size: 1024,
        }
    }

    fn write_record(dir: &Path, file_name: &str, record: &VolumeRecord) {
        let data = serde_json::to_vec(record).expect("encode");
        fs::write(dir.join(file_name), data).expect("write");
    }

    #[test]
    fn record_uses_wire_field_names() {
        let record = new_record("volume-1-uuid", "volume-1");
        let json = serde_json::to_string(&record).expect("serialize");
        assert_eq!(
            json,
            r#"{"name":"volume-1","id":"volume-1-uuid","limitID":1,"size":1024}"#
        );
    }

    #[test]
    fn record_tolerates_unknown_keys() {
        let record: VolumeRecord = serde_json::from_str(
            r#"{"name":"v","id":"u","limitID":7,"size":42,"futureKey":{"a":1}}"#,
        )
        .expect("deserialize");
        assert_eq!(record.limit_id, 7);
        assert_eq!(record.size, 42);
    }

    #[test]
    fn existing_state_is_preloaded() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let expected = new_record("volume-1-uuid", "volume-1");
        write_record(tmp.path(), "volume-1-uuid.json", &expected);

        let store = StateStore::load(tmp.path()).expect("load");
        assert_eq!(store.get_by_id("volume-1-uuid"), Some(expected.clone()));
        assert_eq!(store.get_by_name("volume-1"), Some(expected));
        assert_eq!(store.total_size(), 1024);
        assert_eq!(store.volume_count(), 1);
    }

    #[test]
    fn unknown_volume_returns_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::load(tmp.path()).expect("load");
        assert_eq!(store.get_by_id("volume-1-uuid"), None);
        assert_eq!(store.get_by_name("volume-1"), None);
    }

    #[test]
    fn empty_records_are_ignored_on_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("broken.json"), br#"{"limitID":3,"size":77}"#).expect("write");

        let store = StateStore::load(tmp.path()).expect("load");
        assert_eq!(store.volume_count(), 0);
        assert_eq!(store.total_size(), 0);
    }

    #[test]
    fn subdirectories_are_skipped_on_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        // Volume directories may contain arbitrary workload data, including
        // json files.
        let volume_dir = tmp.path().join("volume-1-uuid");
        fs::create_dir(&volume_dir).expect("mkdir");
        fs::write(volume_dir.join("data.json"), b"not a record").expect("write");

        let store = StateStore::load(tmp.path()).expect("load");
        assert_eq!(store.volume_count(), 0);
    }

    #[test]
    fn malformed_state_file_fails_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("volume-1-uuid.json"), b"{garbage").expect("write");

        assert!(matches!(
            StateStore::load(tmp.path()),
            Err(StateError::Parse { .. })
        ));
    }

    #[test]
    fn save_roundtrips_through_a_fresh_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::load(tmp.path()).expect("load");

        let record = new_record("volume-1-uuid", "volume-1");
        store.save(&record).expect("save");

        let reloaded = StateStore::load(tmp.path()).expect("reload");
        assert_eq!(reloaded.get_by_id("volume-1-uuid"), Some(record.clone()));
        assert_eq!(reloaded.get_by_name("volume-1"), Some(record));
        assert_eq!(reloaded.total_size(), 1024);
    }

    #[test]
    fn delete_removes_file_and_indices() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_record(
            tmp.path(),
            "volume-1-uuid.json",
            &new_record("volume-1-uuid", "volume-1"),
        );

        let store = StateStore::load(tmp.path()).expect("load");
        store.delete("volume-1-uuid").expect("delete");

        assert_eq!(store.get_by_id("volume-1-uuid"), None);
        assert_eq!(store.get_by_name("volume-1"), None);
        assert_eq!(store.total_size(), 0);
        assert!(!tmp.path().join("volume-1-uuid.json").exists());
    }

    #[test]
    fn delete_of_unknown_volume_succeeds() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::load(tmp.path()).expect("load");
        store.delete("volume-1-uuid").expect("delete absent");
        // A second delete after a successful one also succeeds.
        store.delete("volume-1-uuid").expect("delete again");
    }

    #[test]
    fn total_size_accumulates_across_volumes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::load(tmp.path()).expect("load");

        let mut a = new_record("id-a", "a");
        a.size = 100;
        let mut b = new_record("id-b", "b");
        b.size = 200;
        store.save(&a).expect("save a");
        store.save(&b).expect("save b");
        assert_eq!(store.total_size(), 300);
        assert_eq!(store.volumes().len(), 2);

        store.delete("id-a").expect("delete a");
        assert_eq!(store.total_size(), 200);
    }

    #[test]
    fn serialized_record_fits_the_metadata_reserve() {
        let record = VolumeRecord {
            name: "n".repeat(253),
            id: "volume-1-uuid".into(),
            limit_id: u32::MAX,
            size: i64::MAX,
        };
        let data = serde_json::to_vec(&record).expect("encode");
        assert!((data.len() as i64) <= METADATA_FILE_MAX_SIZE);
    }
}
