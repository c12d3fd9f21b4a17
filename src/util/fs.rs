//! Filesystem probing: filesystem-type detection and mount-table lookup.
//!
//! The XFS limiter refuses to start unless the volumes root sits on an XFS
//! filesystem mounted with project-quota support; both checks live here.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use nix::sys::statfs::{self, FsType};

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Returns the filesystem type name of `path`, e.g. `"xfs"`.
///
/// Unrecognized filesystems are reported as the hex magic from `statfs`.
pub fn get_filesystem(path: &Path) -> io::Result<String> {
    let stat = statfs::statfs(path).map_err(io::Error::from)?;
    Ok(filesystem_name(stat.filesystem_type()))
}

fn filesystem_name(fs_type: FsType) -> String {
    match fs_type {
        t if t == statfs::XFS_SUPER_MAGIC => "xfs".to_owned(),
        t if t == statfs::EXT4_SUPER_MAGIC => "ext4".to_owned(),
        t if t == statfs::BTRFS_SUPER_MAGIC => "btrfs".to_owned(),
        t if t == statfs::TMPFS_MAGIC => "tmpfs".to_owned(),
        t if t == statfs::OVERLAYFS_SUPER_MAGIC => "overlay".to_owned(),
        other => format!("{:#x}", other.0),
    }
}

/// One row of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// Filesystem type as the kernel reports it.
    pub fs_type: String,
    /// Mount source (device or pseudo source).
    pub source: String,
    /// Per-mount and per-superblock options, combined.
    pub options: Vec<String>,
}

/// Looks up the mount-table entry whose mount point is exactly `mount_point`.
pub fn find_mount_entry(mount_point: &Path) -> io::Result<Option<MountEntry>> {
    let file = File::open(MOUNTINFO_PATH)?;
    parse_mount_entry(BufReader::new(file), mount_point)
}

/// Parses `/proc/self/mountinfo` content from `reader`.
///
/// Line format (see proc(5)):
/// `36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - xfs /dev/sda1 rw,prjquota`
fn parse_mount_entry<R: BufRead>(reader: R, mount_point: &Path) -> io::Result<Option<MountEntry>> {
    for line in reader.lines() {
        let line = line?;
        let Some((mount_fields, fs_fields)) = line.split_once(" - ") else {
            continue;
        };

        let mount_fields: Vec<&str> = mount_fields.split(' ').collect();
        let fs_fields: Vec<&str> = fs_fields.split(' ').collect();
        if mount_fields.len() < 6 || fs_fields.len() < 3 {
            continue;
        }

        let entry_point = PathBuf::from(unescape_octal(mount_fields[4]));
        if entry_point != mount_point {
            continue;
        }

        let mut options: Vec<String> = mount_fields[5].split(',').map(str::to_owned).collect();
        options.extend(fs_fields[2].split(',').map(str::to_owned));

        return Ok(Some(MountEntry {
            mount_point: entry_point,
            fs_type: fs_fields[0].to_owned(),
            source: unescape_octal(fs_fields[1]),
            options,
        }));
    }

    Ok(None)
}

/// Decodes the `\040`-style octal escapes the kernel uses for whitespace in
/// mount paths.
fn unescape_octal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &s[i + 1..i + 4];
            if let Ok(code) = u8::from_str_radix(digits, 8) {
                out.push(code as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}
